use chrono::{offset::Utc, Duration};

/// An absolute instant at which a storage entry should be considered gone.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Expiry {
    pub timestamp: i64,
}

#[derive(Debug)]
pub struct TimeOverflow {}

impl Expiry {
    pub fn new_from_millis(duration: u64) -> Result<Self, TimeOverflow> {
        Utc::now()
            .checked_add_signed(Duration::milliseconds(duration as i64))
            .map(|t| Self {
                timestamp: t.timestamp_millis(),
            })
            .ok_or(TimeOverflow {})
    }

    pub fn new_from_secs(duration: u64) -> Result<Self, TimeOverflow> {
        Utc::now()
            .checked_add_signed(Duration::seconds(duration as i64))
            .map(|t| Self {
                timestamp: t.timestamp_millis(),
            })
            .ok_or(TimeOverflow {})
    }

    pub fn duration_left_millis(&self) -> i64 {
        self.timestamp - Utc::now().timestamp_millis()
    }

    pub fn is_expired(&self) -> bool {
        self.duration_left_millis() <= 0
    }
}
