use std::time::Duration;

use crate::error::Error;
use crate::types::RepositoryKind;

#[cfg(any(feature = "tracing", feature = "metrics"))]
fn kind_label(kind: RepositoryKind) -> &'static str {
    match kind {
        RepositoryKind::SensorRecords => "sensor_records",
        RepositoryKind::EventLog => "event_log",
    }
}

pub(crate) fn record_submit_ok(netfn: u8, cmd: u8, elapsed: Duration, completion_code: u8) {
    let _ = (netfn, cmd, elapsed, completion_code);

    #[cfg(feature = "metrics")]
    {
        metrics::counter!("mc_requests_total", "outcome" => "ok").increment(1);
        metrics::histogram!("mc_request_seconds").record(elapsed.as_secs_f64());
        if completion_code != 0x00 {
            metrics::counter!("mc_completion_code_nonzero_total").increment(1);
        }
    }

    #[cfg(feature = "tracing")]
    {
        tracing::debug!(
            netfn,
            cmd,
            completion_code,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "request ok"
        );
    }
}

pub(crate) fn record_submit_err(netfn: u8, cmd: u8, elapsed: Duration, err: &Error) {
    let _ = (netfn, cmd, elapsed, err);

    #[cfg(feature = "metrics")]
    {
        metrics::counter!("mc_requests_total", "outcome" => "err").increment(1);
        metrics::counter!("mc_request_errors_total", "kind" => error_kind(err)).increment(1);
        metrics::histogram!("mc_request_seconds").record(elapsed.as_secs_f64());
    }

    #[cfg(feature = "tracing")]
    {
        tracing::warn!(
            netfn,
            cmd,
            error = %err,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "request failed"
        );
    }
}

pub(crate) fn record_retransmit(netfn: u8, cmd: u8) {
    let _ = (netfn, cmd);

    #[cfg(feature = "metrics")]
    metrics::counter!("mc_retransmits_total").increment(1);

    #[cfg(feature = "tracing")]
    tracing::debug!(netfn, cmd, "retransmit");
}

pub(crate) fn record_dropped_frame(reason: &'static str) {
    let _ = reason;

    #[cfg(feature = "metrics")]
    metrics::counter!("mc_dropped_frames_total", "reason" => reason).increment(1);

    #[cfg(feature = "tracing")]
    tracing::debug!(reason, "frame dropped");
}

pub(crate) fn record_sync(kind: RepositoryKind, outcome: &'static str, elapsed: Duration) {
    let _ = (kind, outcome, elapsed);

    #[cfg(feature = "metrics")]
    {
        metrics::counter!(
            "mc_repository_syncs_total",
            "kind" => kind_label(kind),
            "outcome" => outcome
        )
        .increment(1);
        metrics::histogram!("mc_repository_sync_seconds", "kind" => kind_label(kind))
            .record(elapsed.as_secs_f64());
    }

    #[cfg(feature = "tracing")]
    {
        tracing::debug!(
            kind = kind_label(kind),
            outcome,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "repository sync"
        );
    }
}

pub(crate) fn record_reservation_lost(kind: RepositoryKind) {
    let _ = kind;

    #[cfg(feature = "metrics")]
    metrics::counter!("mc_reservations_lost_total", "kind" => kind_label(kind)).increment(1);

    #[cfg(feature = "tracing")]
    tracing::debug!(kind = kind_label(kind), "reservation lost, restarting read");
}

pub(crate) fn record_controller_state(target: u8, state: &'static str) {
    let _ = (target, state);

    #[cfg(feature = "metrics")]
    metrics::counter!("mc_controller_transitions_total", "state" => state).increment(1);

    #[cfg(feature = "tracing")]
    tracing::info!(addr = format_args!("{target:#04x}"), state, "controller");
}

pub(crate) fn trace_receive_thread(state: &'static str) {
    let _ = state;

    #[cfg(feature = "tracing")]
    tracing::debug!(state, "receive thread");
}

pub(crate) fn trace_discovery_thread(state: &'static str) {
    let _ = state;

    #[cfg(feature = "tracing")]
    tracing::debug!(state, "discovery thread");
}

#[cfg(feature = "metrics")]
fn error_kind(err: &Error) -> &'static str {
    match err {
        Error::Io(_) => "io",
        Error::Timeout => "timeout",
        Error::Protocol(_) => "protocol",
        Error::CompletionCode { .. } => "completion_code",
        Error::FetchRetriesExceeded => "fetch_retries",
        Error::Unsupported(_) => "unsupported",
        Error::InvalidArgument(_) => "invalid_argument",
        Error::Closed => "closed",
    }
}
