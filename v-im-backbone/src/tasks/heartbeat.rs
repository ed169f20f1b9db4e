use rand::Rng;
use std::sync::Arc;
use tokio::time::{interval, sleep, Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::ImError;
use crate::gateway::{ConnState, Gateway, Session};
use crate::registry::Lease;

/// 会话租约续约任务 / Lease keeper for one session
///
/// 每个心跳周期续约一次；失败时指数退避重试，直到租约 TTL 耗尽才关闭会话。
/// 网关停机信号到来时直接退出，不注销，租约自然过期。
/// Renews once per heartbeat interval; failures retry with exponential backoff and the
/// session is closed only once the lease TTL is used up. The gateway's stop signal ends
/// the keeper without deregistering, so the lease simply lapses.
pub fn spawn_lease_keeper(gateway: Arc<Gateway>, session: Arc<Session>, lease: Lease) {
    let every = gateway.config().heartbeat_interval;
    let mut closed = session.closed();
    let mut halted = gateway.shutdown_signal();
    tokio::spawn(async move {
        let mut last_renewed = Instant::now();
        loop {
            tokio::select! {
                _ = sleep(every) => {}
                _ = closed.changed() => return,
                _ = halted.changed() => return,
            }
            if !session.state().is_ready() {
                return;
            }
            let _ = session.transition(ConnState::Heartbeat);

            let deadline = last_renewed + lease.ttl;
            let mut backoff = Duration::from_millis(100);
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    gateway
                        .close_session(&session.session_id, "heartbeat timeout")
                        .await;
                    return;
                }
                match tokio::time::timeout(remaining, gateway.registry().renew(&lease)).await {
                    Ok(Ok(())) => {
                        last_renewed = Instant::now();
                        debug!(lease_id = lease.id, session_id = %session.session_id, "💓 lease renewed");
                        break;
                    }
                    Ok(Err(ImError::LeaseExpired(id))) => {
                        warn!(lease_id = id, session_id = %session.session_id, "💔 lease expired under session");
                        gateway.kick(&session, "presence lease expired").await;
                        return;
                    }
                    Ok(Err(e)) => {
                        warn!(
                            lease_id = lease.id,
                            backoff = ?backoff,
                            error = %e,
                            "💓 renew failed, retrying"
                        );
                    }
                    Err(_) => {
                        gateway
                            .close_session(&session.session_id, "heartbeat timeout")
                            .await;
                        return;
                    }
                }
                let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2);
                tokio::select! {
                    _ = sleep(backoff + Duration::from_millis(jitter)) => {}
                    _ = closed.changed() => return,
                    _ = halted.changed() => return,
                }
                backoff = (backoff * 2).min(every);
            }
        }
    });
}

/// 空闲连接清理 / Idle connection cleanup
pub fn spawn_idle_cleanup(gateway: Arc<Gateway>, idle_timeout: Duration) {
    let mut shutdown_rx = gateway.shutdown_signal();
    tokio::spawn(async move {
        let timeout_ms = idle_timeout.as_millis() as u64;
        let cleanup_interval_ms = if timeout_ms <= 1000 {
            (timeout_ms / 2).max(1)
        } else if timeout_ms <= 10000 {
            1000
        } else {
            5000
        };
        info!(
            cleanup_interval_ms,
            idle_timeout_ms = timeout_ms,
            node_id = gateway.node_id(),
            "⏰ idle cleanup scheduled"
        );
        let mut cleanup_interval = interval(Duration::from_millis(cleanup_interval_ms));
        loop {
            tokio::select! {
                _ = cleanup_interval.tick() => {
                    gateway.cleanup_idle_sessions(idle_timeout).await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() { break; }
                }
            }
        }
    });
}
