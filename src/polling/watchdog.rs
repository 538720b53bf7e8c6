// 監視カウンタ
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//

/// 初期値(満タン)
pub const WATCHDOG_MAX: i32 = 10;

/// 今回のポーリングで何をするか
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDecision {
    /// 再始動する
    Restart,
    /// 通信せずに見送る
    Skip,
    /// 読み取る
    Poll,
}

/// 失敗するたびに減って、0で再始動する。
/// 2から8の偶数のときはポーリングを見送る。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watchdog(i32);

impl Default for Watchdog {
    fn default() -> Self {
        Watchdog(WATCHDOG_MAX)
    }
}

impl Watchdog {
    pub fn count(&self) -> i32 {
        self.0
    }

    /// 今回のポーリングを決める
    ///
    /// 0以下なら再始動、2から8の偶数なら見送り、それ以外は読み取り。
    /// 見送りも失敗と同じく1つ減らす。減らさないと偶数のまま止まって
    /// 二度と読み取らなくなる。
    pub fn decide(&mut self) -> PollDecision {
        if self.0 <= 0 {
            PollDecision::Restart
        } else if 1 < self.0 && self.0 < 9 && self.0 % 2 == 0 {
            self.0 -= 1;
            PollDecision::Skip
        } else {
            PollDecision::Poll
        }
    }

    pub fn fail(&mut self) {
        self.0 = (self.0 - 1).max(0);
    }

    pub fn reset(&mut self) {
        self.0 = WATCHDOG_MAX;
    }
}

#[test]
fn test_watchdog_sequence() {
    let mut watchdog = Watchdog::default();
    let mut decisions = Vec::new();
    loop {
        let decision = watchdog.decide();
        decisions.push(decision);
        match decision {
            PollDecision::Restart => break,
            PollDecision::Skip => {}
            PollDecision::Poll => watchdog.fail(),
        }
    }
    use PollDecision::*;
    assert_eq!(
        decisions,
        vec![Poll, Poll, Skip, Poll, Skip, Poll, Skip, Poll, Skip, Poll, Restart]
    );
    assert_eq!(watchdog.count(), 0);
}

#[test]
fn test_watchdog_skip_decrements() {
    let mut watchdog = Watchdog(8);
    assert_eq!(watchdog.decide(), PollDecision::Skip);
    assert_eq!(watchdog.count(), 7);
    assert_eq!(watchdog.decide(), PollDecision::Poll);
    assert_eq!(watchdog.count(), 7);
}

#[test]
fn test_watchdog_reset() {
    let mut watchdog = Watchdog::default();
    watchdog.fail();
    watchdog.fail();
    assert_eq!(watchdog.count(), 8);
    watchdog.reset();
    assert_eq!(watchdog.count(), WATCHDOG_MAX);
    assert_eq!(watchdog.decide(), PollDecision::Poll);
}

#[test]
fn test_watchdog_floor() {
    let mut watchdog = Watchdog(1);
    watchdog.fail();
    watchdog.fail();
    assert_eq!(watchdog.count(), 0);
    assert_eq!(watchdog.decide(), PollDecision::Restart);
    assert_eq!(watchdog.count(), 0);
}
