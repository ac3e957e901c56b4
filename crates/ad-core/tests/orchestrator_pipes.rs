//! NormalizerOrchestrator over in-memory pipes and real helper processes.

use ad_common::{Error, JobId, ProcessRunCode, Result};
use ad_core::mock_process::{MockNormalizerFactory, Scorer};
use ad_core::normalize::{InitialState, Normalizable, Normalizer};
use ad_core::orchestrator::{NativeNormalizerFactory, NormalizerOrchestrator, RawScoreProvider};
use ad_core::results::{Bucket, BucketInfluencer};
use std::sync::Arc;

fn job() -> JobId {
    JobId::parse("network-1").unwrap()
}

struct Scores(Vec<(i64, f64)>);

impl RawScoreProvider for Scores {
    fn raw_scores(&self, _job_id: &JobId) -> Result<Vec<(i64, f64)>> {
        Ok(self.0.clone())
    }
}

#[test]
fn test_results_come_back_in_epoch_order() {
    let factory = Arc::new(MockNormalizerFactory::new());
    let orchestrator = NormalizerOrchestrator::new(job(), factory.clone());

    let results = orchestrator
        .normalize_job(&Scores(vec![(600, 3.5), (0, 1.25), (300, 2.0)]), Some("state-7"))
        .unwrap();

    let raw: Vec<f64> = results.iter().map(|r| r.raw_anomaly_score).collect();
    assert_eq!(raw, vec![1.25, 2.0, 3.5]);

    let invocations = factory.invocations();
    assert_eq!(invocations.len(), 1);
    assert_eq!(invocations[0].header, vec!["anomalyScore"]);
    assert_eq!(invocations[0].rows, vec![vec!["1.25"], vec!["2"], vec!["3.5"]]);
    assert_eq!(invocations[0].quantiles_state.as_deref(), Some("state-7"));
}

#[test]
fn test_empty_snapshot_spawns_nothing() {
    let factory = Arc::new(MockNormalizerFactory::new());
    let orchestrator = NormalizerOrchestrator::new(job(), factory.clone());
    let results = orchestrator.normalize_job(&Scores(Vec::new()), None).unwrap();
    assert!(results.is_empty());
    assert!(factory.invocations().is_empty());
}

#[test]
fn test_large_batch_does_not_deadlock() {
    let factory = Arc::new(MockNormalizerFactory::new());
    let orchestrator = NormalizerOrchestrator::new(job(), factory);
    let scores: Vec<(i64, f64)> = (0..20_000).map(|i| (i * 60, (i % 97) as f64)).collect();

    let results = orchestrator.normalize_job(&Scores(scores), None).unwrap();
    assert_eq!(results.len(), 20_000);
    assert_eq!(results[96].raw_anomaly_score, 96.0);
    assert_eq!(results[97].raw_anomaly_score, 0.0);
}

#[test]
fn test_malformed_rows_stay_local() {
    let scorer: Scorer = Arc::new(|_header: &[String], row: &[String]| {
        if row[0] == "2" {
            r#"{"rawAnomalyScore":"not-a-number","anomalyScore":"7","extra":true}"#.to_string()
        } else {
            format!(r#"{{"rawAnomalyScore":"{}","id":"r{}"}}"#, row[0], row[0])
        }
    });
    let factory = Arc::new(MockNormalizerFactory::new().with_scorer(scorer));
    let orchestrator = NormalizerOrchestrator::new(job(), factory);

    let results = orchestrator
        .normalize_job(&Scores(vec![(0, 1.0), (300, 2.0), (600, 3.0)]), None)
        .unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].id, "r1");
    assert_eq!(results[1].raw_anomaly_score, 0.0);
    assert_eq!(results[1].normalized_sys_change_score, 7.0);
    assert_eq!(results[2].raw_anomaly_score, 3.0);
}

#[test]
fn test_short_answer_is_unexpected_result_count() {
    let factory = Arc::new(MockNormalizerFactory::new().drop_last_row());
    let orchestrator = NormalizerOrchestrator::new(job(), factory);

    let mut bucket = Bucket {
        timestamp: 300,
        bucket_influencers: vec![
            BucketInfluencer {
                probability: 0.1,
                ..Default::default()
            },
            BucketInfluencer {
                probability: 0.2,
                ..Default::default()
            },
        ],
        ..Default::default()
    };
    let mut roots = vec![Normalizable::Bucket(&mut bucket)];
    let err = Normalizer::new(&orchestrator)
        .normalize(300, &mut roots, "q")
        .unwrap_err();
    assert!(matches!(
        err,
        Error::NativeProcessRun {
            code: ProcessRunCode::UnexpectedResultCount,
            ..
        }
    ));
}

#[cfg(unix)]
mod native {
    use super::*;

    fn sh(script: &str) -> Arc<NativeNormalizerFactory> {
        Arc::new(NativeNormalizerFactory::new(
            "sh",
            vec!["-c".to_string(), script.to_string()],
        ))
    }

    #[test]
    fn test_native_helper_round_trip() {
        let orchestrator = NormalizerOrchestrator::new(
            job(),
            sh(r#"cat >/dev/null; echo '{"rawAnomalyScore":"0.0","normalizedProbability":"","anomalyScore":"0"}'; echo '{"rawAnomalyScore":"4.5","normalizedProbability":"61.2","anomalyScore":"12"}'"#),
        );
        let results = orchestrator
            .normalize(&InitialState::from_scores([(0, 0.0), (300, 4.5)]), Some("q"), None)
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].normalized_probability, 0.0);
        assert_eq!(results[1].raw_anomaly_score, 4.5);
        assert_eq!(results[1].normalized_probability, 61.2);
        assert_eq!(results[1].normalized_sys_change_score, 12.0);
    }

    #[test]
    fn test_native_helper_failure_reports_stderr() {
        let orchestrator = NormalizerOrchestrator::new(
            job(),
            sh("cat >/dev/null; echo 'bad quantiles state' >&2; exit 3"),
        );
        let err = orchestrator
            .normalize(&InitialState::from_scores([(0, 1.0)]), None, None)
            .unwrap_err();
        match err {
            Error::NativeProcessRun { code, message } => {
                assert_eq!(code, ProcessRunCode::ProcessFailed);
                assert!(message.contains("bad quantiles state"), "{message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_missing_helper_is_start_failure() {
        let orchestrator = NormalizerOrchestrator::new(
            job(),
            Arc::new(NativeNormalizerFactory::new(
                "/nonexistent/normalizer-helper",
                Vec::new(),
            )),
        );
        let err = orchestrator
            .normalize(&InitialState::from_scores([(0, 1.0)]), None, None)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::NativeProcessRun {
                code: ProcessRunCode::StartFailed,
                ..
            }
        ));
    }
}
