use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use super::StatusChannel;
use crate::config::HeartbeatConfig;
use crate::envelope::{Envelope, MessageKind};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeartbeatError {
    #[error("ping could not be delivered after {attempts} attempts")]
    PingFailed { attempts: u32 },
    #[error("no pong received after {attempts} attempts")]
    PongFailed { attempts: u32 },
    #[error("client closed the connection")]
    Closed,
}

/// Ping/pong liveness check over a status channel. Counters are local to
/// each [`Heartbeat::check`], so one good round-trip resets them.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    config: HeartbeatConfig,
}

impl Heartbeat {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self { config }
    }

    pub async fn check<C>(&self, channel: &mut C) -> Result<(), HeartbeatError>
    where
        C: StatusChannel + ?Sized,
    {
        self.send_ping(channel).await?;
        self.await_pong(channel).await
    }

    async fn send_ping<C>(&self, channel: &mut C) -> Result<(), HeartbeatError>
    where
        C: StatusChannel + ?Sized,
    {
        let ping = Envelope::ping();
        let attempts = self.config.max_ping_retries.max(1);

        for attempt in 1..=attempts {
            match timeout(self.config.response_timeout(), channel.send(&ping)).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(err)) => warn!(attempt, error = %err, "Failed to send ping"),
                Err(_) => warn!(attempt, "Timed out sending ping"),
            }
            if attempt < attempts {
                sleep(self.config.retry_interval()).await;
            }
        }

        Err(HeartbeatError::PingFailed { attempts })
    }

    async fn await_pong<C>(&self, channel: &mut C) -> Result<(), HeartbeatError>
    where
        C: StatusChannel + ?Sized,
    {
        let attempts = self.config.max_pong_retries.max(1);

        for attempt in 1..=attempts {
            match timeout(self.config.response_timeout(), channel.recv()).await {
                Ok(Some(Ok(envelope))) if envelope.kind() == MessageKind::Pong => {
                    debug!(attempt, "Received pong");
                    return Ok(());
                }
                Ok(Some(Ok(envelope))) => {
                    warn!(attempt, kind = %envelope.kind(), "Expected pong");
                }
                Ok(Some(Err(err))) => warn!(attempt, error = %err, "Unreadable heartbeat reply"),
                Ok(None) => return Err(HeartbeatError::Closed),
                Err(_) => warn!(attempt, "Timed out waiting for pong"),
            }
            if attempt < attempts {
                sleep(self.config.retry_interval()).await;
            }
        }

        Err(HeartbeatError::PongFailed { attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_support::ScriptedChannel;
    use crate::session::ChannelError;
    use std::time::Duration;
    use tokio::time::Instant;

    fn heartbeat(max_ping_retries: u32, max_pong_retries: u32) -> Heartbeat {
        Heartbeat::new(HeartbeatConfig {
            max_ping_retries,
            max_pong_retries,
            retry_interval_ms: 300,
            response_timeout_ms: 3000,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn pong_completes_the_round_trip() {
        let mut channel = ScriptedChannel::default().with_auto_pong();

        heartbeat(4, 4).check(&mut channel).await.unwrap();

        assert_eq!(channel.sent_kinds(), vec![MessageKind::Ping]);
        assert_eq!(channel.recv_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_fails_after_max_pong_attempts() {
        let mut channel = ScriptedChannel::default();
        let started = Instant::now();

        let err = heartbeat(4, 2).check(&mut channel).await.unwrap_err();

        assert_eq!(err, HeartbeatError::PongFailed { attempts: 2 });
        assert_eq!(channel.recv_calls, 2);
        // Two response timeouts plus one retry interval between them.
        assert!(started.elapsed() >= Duration::from_millis(6300));
    }

    #[tokio::test(start_paused = true)]
    async fn other_kinds_count_as_failed_attempts() {
        let mut channel = ScriptedChannel::default();
        channel.push_inbound(Envelope::running("still here", None));
        channel.push_inbound(Envelope::pong());

        heartbeat(4, 4).check(&mut channel).await.unwrap();
        assert_eq!(channel.recv_calls, 2);

        let mut channel = ScriptedChannel::default();
        channel.push_inbound(Envelope::running("one", None));
        channel.push_inbound(Envelope::running("two", None));
        channel.push_inbound(Envelope::pong());

        let err = heartbeat(4, 2).check(&mut channel).await.unwrap_err();
        assert_eq!(err, HeartbeatError::PongFailed { attempts: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn ping_send_failures_are_retried_then_reported() {
        let mut channel = ScriptedChannel::default().with_auto_pong();
        channel.fail_sends = 2;
        heartbeat(3, 4).check(&mut channel).await.unwrap();
        assert_eq!(channel.sent_kinds(), vec![MessageKind::Ping]);

        let mut channel = ScriptedChannel::default().with_auto_pong();
        channel.fail_sends = 10;
        let err = heartbeat(3, 4).check(&mut channel).await.unwrap_err();
        assert_eq!(err, HeartbeatError::PingFailed { attempts: 3 });
        assert_eq!(channel.recv_calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_connection_fails_immediately() {
        let mut channel = ScriptedChannel::default();
        channel.peer_closed = true;

        let err = heartbeat(4, 4).check(&mut channel).await.unwrap_err();
        assert_eq!(err, HeartbeatError::Closed);
        assert_eq!(channel.recv_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_reply_is_a_failed_attempt() {
        let mut channel = ScriptedChannel::default();
        channel
            .inbound
            .push_back(Err(ChannelError::Decode("not json".to_string())));
        channel.push_inbound(Envelope::pong());

        heartbeat(4, 4).check(&mut channel).await.unwrap();
        assert_eq!(channel.recv_calls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn each_check_starts_with_fresh_counters() {
        let hb = heartbeat(4, 2);
        let mut channel = ScriptedChannel::default();
        channel.push_inbound(Envelope::running("noise", None));
        channel.push_inbound(Envelope::pong());
        channel.push_inbound(Envelope::running("noise", None));
        channel.push_inbound(Envelope::pong());

        hb.check(&mut channel).await.unwrap();
        hb.check(&mut channel).await.unwrap();
        assert_eq!(channel.recv_calls, 4);
    }
}
