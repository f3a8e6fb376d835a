//! Graph timers.
//!
//! A timer command toggles: an unknown id starts a timer, a known one
//! stops it. Each expiry delivers a timeout message back to whoever
//! asked. Active timers hold the engine open, so teardown clears them
//! before checking readiness.

use super::Engine;
use crate::msg::{Loc, Msg, Payload, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};

pub(crate) struct TimerEntry {
    /// Fires left; negative means until stopped.
    remaining: i64,
    period: Duration,
    requester: Loc,
}

impl Engine {
    pub(super) fn handle_timer_cmd(&mut self, msg: Msg) {
        let payload = match &msg.payload {
            Payload::Timer(t) => t.clone(),
            _ => {
                warn!(
                    "[Engine {}] timer cmd without a timer payload, dropped",
                    self.graph_id
                );
                return;
            }
        };

        if self.timers.remove(&payload.timer_id).is_some() {
            debug!("[Engine {}] timer {} stopped", self.graph_id, payload.timer_id);
            let res = Msg::result_from(StatusCode::Ok, &msg).with_detail("timer stopped");
            self.dispatch_msg(res);
            self.check_close_ready();
            return;
        }

        if self.is_closing {
            debug!(
                "[Engine {}] ignoring new timer {} while closing",
                self.graph_id, payload.timer_id
            );
            return;
        }

        let entry = TimerEntry {
            remaining: if payload.times > 0 { payload.times } else { -1 },
            period: Duration::from_micros(payload.timeout_us),
            requester: msg.src.clone(),
        };
        self.timers.insert(payload.timer_id, entry);
        self.schedule_timer(payload.timer_id);

        let res = Msg::result_from(StatusCode::Ok, &msg).with_detail("timer started");
        self.dispatch_msg(res);
    }

    fn schedule_timer(&mut self, id: u32) {
        let period = match self.timers.get(&id) {
            Some(t) => t.period,
            None => return,
        };
        self.handle.post_delayed(period, move |engine| engine.on_timer_fire(id));
    }

    pub(crate) fn on_timer_fire(&mut self, id: u32) {
        let (requester, exhausted) = match self.timers.get_mut(&id) {
            // Stopped in the meantime; the stale wakeup is a no-op.
            None => return,
            Some(t) => {
                if t.remaining > 0 {
                    t.remaining -= 1;
                }
                (t.requester.clone(), t.remaining == 0)
            }
        };

        if self.is_closing {
            self.timers.remove(&id);
            self.check_close_ready();
            return;
        }

        let mut timeout = Msg::timeout(id);
        timeout.src = Loc::graph(&self.app_uri, &self.graph_id);
        timeout.clear_and_set_dest(requester);
        self.dispatch_msg(timeout);

        if exhausted {
            self.timers.remove(&id);
        } else {
            self.schedule_timer(id);
        }
    }
}
