//! Enter/exit behavior table
//!
//! Each state maps to a static pair of hooks. Hooks run with the machine
//! locked, between the exit of the old state and the enter of the new one.

use super::{as_millis, Context, HeartbeatSchedule, TimeoutKind, Transition};
use crate::types::{ErrorCode, PlayerState, VideoStartFailedReason};
use tokio::time::Instant;
use tracing::{debug, warn};

type Hook = fn(&mut Context<'_>, &Transition);

pub(super) struct Behavior {
    pub on_enter: Hook,
    pub on_exit: Hook,
}

fn noop(_: &mut Context<'_>, _: &Transition) {}

static BOOKKEEPING: Behavior = Behavior {
    on_enter: noop,
    on_exit: noop,
};

static STARTUP: Behavior = Behavior {
    on_enter: enter_startup,
    on_exit: exit_startup,
};

static BUFFERING: Behavior = Behavior {
    on_enter: enter_buffering,
    on_exit: exit_buffering,
};

static ERROR: Behavior = Behavior {
    on_enter: enter_error,
    on_exit: clear_failure_reason,
};

static EXIT_BEFORE_VIDEO_START: Behavior = Behavior {
    on_enter: enter_exit_before_video_start,
    on_exit: clear_failure_reason,
};

static PLAYING: Behavior = Behavior {
    on_enter: enter_playing,
    on_exit: exit_playing,
};

static PAUSE: Behavior = Behavior {
    on_enter: noop,
    on_exit: exit_pause,
};

static QUALITY_CHANGE: Behavior = Behavior {
    on_enter: enter_quality_change,
    on_exit: exit_quality_change,
};

static AUDIO_TRACK_CHANGE: Behavior = Behavior {
    on_enter: noop,
    on_exit: exit_audio_track_change,
};

static SUBTITLE_CHANGE: Behavior = Behavior {
    on_enter: noop,
    on_exit: exit_subtitle_change,
};

static SEEKING: Behavior = Behavior {
    on_enter: enter_seeking,
    on_exit: exit_seeking,
};

pub(super) fn of(state: PlayerState) -> &'static Behavior {
    match state {
        PlayerState::Startup => &STARTUP,
        PlayerState::Buffering => &BUFFERING,
        PlayerState::Error => &ERROR,
        PlayerState::ExitBeforeVideoStart => &EXIT_BEFORE_VIDEO_START,
        PlayerState::Playing => &PLAYING,
        PlayerState::Pause => &PAUSE,
        PlayerState::QualityChange => &QUALITY_CHANGE,
        PlayerState::AudioTrackChange => &AUDIO_TRACK_CHANGE,
        PlayerState::SubtitleChange => &SUBTITLE_CHANGE,
        PlayerState::Seeking => &SEEKING,
        PlayerState::Setup
        | PlayerState::Ready
        | PlayerState::SourceChanged
        | PlayerState::Ad
        | PlayerState::AdFinished
        | PlayerState::CustomDataChange => &BOOKKEEPING,
    }
}

// Startup

fn enter_startup(ctx: &mut Context<'_>, _: &Transition) {
    let timeout = ctx.config().startup_timeout();
    ctx.arm_timeout(TimeoutKind::Startup, timeout, startup_timed_out);
}

fn exit_startup(ctx: &mut Context<'_>, t: &Transition) {
    ctx.cancel_timeout();
    ctx.core.startup_time += t.elapsed;

    if t.to == PlayerState::Playing {
        ctx.core.startup_finished = true;
        let video_startup_ms = as_millis(ctx.core.startup_time);
        let player_startup_ms = ctx.core.player_startup_time.map(as_millis).unwrap_or(0);
        debug!(video_startup_ms, player_startup_ms, "Startup finished");
        ctx.notify(t.from, Some(t.to), as_millis(t.elapsed), |l, s| {
            l.on_startup(s, video_startup_ms, player_startup_ms)
        });
    }
}

pub(super) fn startup_timed_out(ctx: &mut Context<'_>) {
    if ctx.core.current != PlayerState::Startup {
        return;
    }
    warn!(
        impression_id = %ctx.core.impression.id,
        timeout_ms = ctx.config().startup_timeout_ms,
        "Video start timed out"
    );
    ctx.core.video_start_failed_reason = Some(VideoStartFailedReason::Timeout);
    let position = ctx.current_position();
    ctx.transition(PlayerState::ExitBeforeVideoStart, position);
}

// Buffering

fn enter_buffering(ctx: &mut Context<'_>, _: &Transition) {
    ctx.start_heartbeat(HeartbeatSchedule::Rebuffering);
    let timeout = ctx.config().rebuffering_timeout();
    ctx.arm_timeout(TimeoutKind::Rebuffering, timeout, rebuffering_timed_out);
}

fn exit_buffering(ctx: &mut Context<'_>, t: &Transition) {
    ctx.cancel_heartbeat();
    ctx.cancel_timeout();
    let duration_ms = as_millis(t.elapsed);
    ctx.notify(t.from, Some(t.to), duration_ms, |l, s| l.on_rebuffering(s, duration_ms));
}

pub(super) fn rebuffering_timed_out(ctx: &mut Context<'_>) {
    if ctx.core.current != PlayerState::Buffering {
        return;
    }
    warn!(
        impression_id = %ctx.core.impression.id,
        timeout_ms = ctx.config().rebuffering_timeout_ms,
        "Rebuffering timed out"
    );
    ctx.core.pending_error = Some(ErrorCode::buffering_timeout_reached());
    let position = ctx.current_position();
    ctx.transition(PlayerState::Error, position);
}

// Error and failed starts

fn enter_error(ctx: &mut Context<'_>, t: &Transition) {
    ctx.cancel_timeout();
    if !ctx.core.startup_finished {
        ctx.core.video_start_failed_reason = Some(VideoStartFailedReason::PlayerError);
    }
    let error = ctx
        .core
        .pending_error
        .take()
        .unwrap_or_else(|| ErrorCode::new(0, "UNKNOWN_ERROR"));
    ctx.notify(t.to, None, 0, |l, s| l.on_error(s, &error));
}

fn enter_exit_before_video_start(ctx: &mut Context<'_>, t: &Transition) {
    let reason = *ctx
        .core
        .video_start_failed_reason
        .get_or_insert(VideoStartFailedReason::PageClosed);
    ctx.notify(t.to, None, 0, |l, s| l.on_video_start_failed(s, reason));
}

fn clear_failure_reason(ctx: &mut Context<'_>, _: &Transition) {
    ctx.core.video_start_failed_reason = None;
}

// Playing and pause

fn enter_playing(ctx: &mut Context<'_>, _: &Transition) {
    ctx.start_heartbeat(HeartbeatSchedule::Playing);
}

fn exit_playing(ctx: &mut Context<'_>, t: &Transition) {
    ctx.cancel_heartbeat();
    let duration_ms = as_millis(t.elapsed);
    ctx.notify(t.from, Some(t.to), duration_ms, |l, s| l.on_play_exit(s, duration_ms));
}

fn exit_pause(ctx: &mut Context<'_>, t: &Transition) {
    let duration_ms = as_millis(t.elapsed);
    ctx.notify(t.from, Some(t.to), duration_ms, |l, s| l.on_pause_exit(s, duration_ms));
}

pub(super) fn heartbeat_tick(ctx: &mut Context<'_>) {
    let state = ctx.core.current;
    if !matches!(state, PlayerState::Playing | PlayerState::Buffering) {
        return;
    }
    let now = Instant::now();
    let duration_ms = as_millis(now.saturating_duration_since(ctx.core.entered_at));
    let position = ctx.current_position();
    ctx.core.video_time_end_ms = position;

    ctx.notify(state, None, duration_ms, |l, s| l.on_heartbeat(s, duration_ms));

    ctx.core.entered_at = now;
    ctx.core.video_time_start_ms = position;
}

// Quality changes

fn enter_quality_change(ctx: &mut Context<'_>, _: &Transition) {
    ctx.core.quality_change_count = ctx.core.quality_change_count.saturating_add(1);
    ctx.ensure_quality_window();
}

fn exit_quality_change(ctx: &mut Context<'_>, t: &Transition) {
    let count = ctx.core.quality_change_count;
    let threshold = ctx.config().quality_change_threshold;

    if count <= threshold {
        ctx.notify(t.from, Some(t.to), as_millis(t.elapsed), |l, s| l.on_quality_change(s));
    } else if count == threshold + 1 {
        warn!(count, threshold, "Quality change threshold exceeded");
        let error = ErrorCode::quality_change_threshold_exceeded();
        ctx.notify(t.from, Some(t.to), as_millis(t.elapsed), |l, s| l.on_error(s, &error));
    }
}

pub(super) fn quality_window_elapsed(ctx: &mut Context<'_>) {
    debug!(count = ctx.core.quality_change_count, "Quality change window reset");
    ctx.core.quality_change_count = 0;
    ctx.core.quality_window = None;
}

// Track changes

fn exit_audio_track_change(ctx: &mut Context<'_>, t: &Transition) {
    ctx.notify(t.from, Some(t.to), as_millis(t.elapsed), |l, s| l.on_audio_track_change(s));
}

fn exit_subtitle_change(ctx: &mut Context<'_>, t: &Transition) {
    ctx.notify(t.from, Some(t.to), as_millis(t.elapsed), |l, s| l.on_subtitle_change(s));
}

// Seeking

fn enter_seeking(ctx: &mut Context<'_>, t: &Transition) {
    ctx.core.seek_started_at = Some(t.at);
}

fn exit_seeking(ctx: &mut Context<'_>, t: &Transition) {
    let started = ctx.core.seek_started_at.take().unwrap_or(t.at - t.elapsed);
    let duration_ms = as_millis(t.at.saturating_duration_since(started));
    ctx.notify(t.from, Some(t.to), duration_ms, |l, s| l.on_seek_complete(s, duration_ms));
}
