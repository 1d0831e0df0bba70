//! Terminal view of the session snapshot.

use asc_live_core::{Role, SessionSnapshot, SessionStatus};
use tokio::sync::watch;

const METER_WIDTH: usize = 10;

/// What has already been printed.
#[derive(Debug, Default)]
pub struct RenderState {
    status: Option<SessionStatus>,
    transcript_len: usize,
    meter: Option<usize>,
}

/// Lines to print for the difference between `state` and `snapshot`.
pub fn render_changes(state: &mut RenderState, snapshot: &SessionSnapshot) -> Vec<String> {
    let mut lines = Vec::new();

    if state.status != Some(snapshot.status) {
        lines.push(format!("[{}]", snapshot.status.as_str()));
        state.status = Some(snapshot.status);
    }

    // A new session starts from an empty transcript.
    if snapshot.transcript.len() < state.transcript_len {
        state.transcript_len = 0;
    }
    for entry in &snapshot.transcript[state.transcript_len..] {
        let speaker = match entry.role {
            Role::User => "you",
            Role::Model => "tutor",
        };
        lines.push(format!("{speaker}: {}", entry.text));
    }
    state.transcript_len = snapshot.transcript.len();

    let meter = meter_bucket(snapshot.volume_level);
    if snapshot.status.is_open() && state.meter != Some(meter) {
        lines.push(format!(
            "[mic {}{}]",
            "#".repeat(meter),
            ".".repeat(METER_WIDTH - meter)
        ));
    }
    state.meter = Some(meter);

    lines
}

fn meter_bucket(level: f32) -> usize {
    let scaled = (level / 255.0 * METER_WIDTH as f32).round();
    if scaled.is_nan() {
        return 0;
    }
    (scaled.max(0.0) as usize).min(METER_WIDTH)
}

/// Prints every change until the session is dropped.
pub async fn render_snapshots(mut snapshots: watch::Receiver<SessionSnapshot>) {
    let mut state = RenderState::default();
    loop {
        let snapshot = snapshots.borrow_and_update().clone();
        for line in render_changes(&mut state, &snapshot) {
            println!("{line}");
        }
        if snapshots.changed().await.is_err() {
            break;
        }
    }
}
