//! Bolt protocol versions and capability predicates.

use std::fmt;

/// A negotiated Bolt protocol version.
///
/// Ordering is (major, minor) lexicographic, so capability checks read as
/// plain comparisons against the version that introduced a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BoltVersion {
    pub major: u8,
    pub minor: u8,
}

impl BoltVersion {
    pub const V3_0: Self = Self::new(3, 0);
    pub const V4_1: Self = Self::new(4, 1);
    pub const V4_2: Self = Self::new(4, 2);
    pub const V4_3: Self = Self::new(4, 3);
    pub const V4_4: Self = Self::new(4, 4);
    pub const V5_0: Self = Self::new(5, 0);
    pub const V5_1: Self = Self::new(5, 1);
    pub const V5_2: Self = Self::new(5, 2);
    pub const V5_4: Self = Self::new(5, 4);
    pub const V5_7: Self = Self::new(5, 7);

    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Whether this driver implements the version. Supported: 3.0, 4.1–4.4,
    /// 5.0–5.7.
    pub fn is_supported(self) -> bool {
        matches!(
            (self.major, self.minor),
            (3, 0) | (4, 1..=4) | (5, 0..=7)
        )
    }

    /// PULL/DISCARD carry {n, qid} extras from 4.0; Bolt 3 only has
    /// PULL_ALL/DISCARD_ALL.
    pub fn supports_qid(self) -> bool {
        self.major >= 4
    }

    /// The ROUTE message replaced the routing procedure in 4.3.
    pub fn supports_route(self) -> bool {
        self >= Self::V4_3
    }

    /// LOGON/LOGOFF split authentication out of HELLO in 5.1.
    pub fn supports_logon(self) -> bool {
        self >= Self::V5_1
    }

    /// 4.3/4.4 encode UTC temporals only behind the "utc" HELLO patch;
    /// 5.0+ always uses UTC encoding.
    pub fn needs_utc_patch(self) -> bool {
        matches!((self.major, self.minor), (4, 3) | (4, 4))
    }

    /// Notification filtering extras arrived in 5.2.
    pub fn supports_notification_filters(self) -> bool {
        self >= Self::V5_2
    }

    /// TELEMETRY arrived in 5.4.
    pub fn supports_telemetry(self) -> bool {
        self >= Self::V5_4
    }
}

impl fmt::Display for BoltVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}
