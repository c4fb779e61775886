//! Ping/pong liveness probes. The peer echoes the hub's send timestamp so
//! the hub can compute round-trip time without trusting the peer's clock.

use serde::{Deserialize, Serialize};

use super::unix_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ping {
    pub nonce: u64,
    pub sent_at: i64,
}

impl Ping {
    pub fn new(nonce: u64) -> Self {
        Self {
            nonce,
            sent_at: unix_millis(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pong {
    pub nonce: u64,
    pub echoed_sent_at: i64,
}

impl Pong {
    pub fn answer(ping: &Ping) -> Self {
        Self {
            nonce: ping.nonce,
            echoed_sent_at: ping.sent_at,
        }
    }

    /// Round-trip time in milliseconds as seen at `now_ms`. Clock steps
    /// backwards clamp to zero.
    pub fn round_trip_ms(&self, now_ms: i64) -> u64 {
        u64::try_from(now_ms.saturating_sub(self.echoed_sent_at)).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pong_echoes_ping() {
        let ping = Ping { nonce: 42, sent_at: 1_000 };
        let pong = Pong::answer(&ping);
        assert_eq!(pong.nonce, 42);
        assert_eq!(pong.round_trip_ms(1_035), 35);
    }

    #[test]
    fn test_round_trip_never_negative() {
        let pong = Pong { nonce: 1, echoed_sent_at: 5_000 };
        assert_eq!(pong.round_trip_ms(4_000), 0);
    }
}
