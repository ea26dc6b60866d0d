//! Local-time admission window
//!
//! Admits connections only while the wall clock in a configured IANA zone
//! falls inside a `[start, end)` minute-of-day window. Windows may wrap
//! midnight (e.g. 23:00-02:00).

use anyhow::anyhow;
use chrono::{Timelike, Utc};
use chrono_tz::Tz;
use tracing::info;

use crate::config::TimeWindowConfig;

/// Time-window admission filter, immutable after construction
pub struct TimeWindowFilter {
    enabled: bool,
    tz: Tz,
    start_minutes: u32,
    end_minutes: u32,
}

impl TimeWindowFilter {
    pub fn new(config: &TimeWindowConfig) -> anyhow::Result<Self> {
        if !config.enabled {
            return Ok(Self {
                enabled: false,
                tz: chrono_tz::UTC,
                start_minutes: 0,
                end_minutes: 0,
            });
        }

        let tz: Tz = config
            .timezone
            .parse()
            .map_err(|_| anyhow!("invalid timezone '{}'", config.timezone))?;
        let start_minutes = parse_hhmm(&config.start_time)?;
        let end_minutes = parse_hhmm(&config.end_time)?;

        info!(
            "[time-window] enabled: {} - {} ({})",
            config.start_time, config.end_time, config.timezone
        );

        Ok(Self {
            enabled: true,
            tz,
            start_minutes,
            end_minutes,
        })
    }

    /// True when the current wall time in the configured zone is inside the
    /// window. Always true when disabled.
    pub fn in_window(&self) -> bool {
        if !self.enabled {
            return true;
        }

        let now = Utc::now().with_timezone(&self.tz);
        let current = now.hour() * 60 + now.minute();
        window_admits(self.start_minutes, self.end_minutes, current)
    }
}

/// Window membership on minute-of-day values. `start <= end` is a same-day
/// window `[start, end)`; `start > end` wraps midnight and admits
/// `[start, 1440) ∪ [0, end)`.
pub fn window_admits(start: u32, end: u32, current: u32) -> bool {
    if start <= end {
        current >= start && current < end
    } else {
        current >= start || current < end
    }
}

/// Parse "HH:MM" into minute-of-day
pub fn parse_hhmm(s: &str) -> anyhow::Result<u32> {
    let (h, m) = s
        .split_once(':')
        .ok_or_else(|| anyhow!("expected HH:MM, got '{}'", s))?;
    let hour: u32 = h.parse().map_err(|_| anyhow!("bad hour in '{}'", s))?;
    let minute: u32 = m.parse().map_err(|_| anyhow!("bad minute in '{}'", s))?;
    if hour > 23 || minute > 59 {
        return Err(anyhow!("time out of range: '{}'", s));
    }
    Ok(hour * 60 + minute)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeWindowConfig;

    #[test]
    fn test_parse_hhmm() {
        assert_eq!(parse_hhmm("00:00").unwrap(), 0);
        assert_eq!(parse_hhmm("09:30").unwrap(), 570);
        assert_eq!(parse_hhmm("23:59").unwrap(), 1439);
        assert!(parse_hhmm("24:00").is_err());
        assert!(parse_hhmm("12:60").is_err());
        assert!(parse_hhmm("noon").is_err());
        assert!(parse_hhmm("12").is_err());
    }

    #[test]
    fn test_same_day_window() {
        // 09:00 - 17:00
        let (s, e) = (540, 1020);
        assert!(!window_admits(s, e, 539));
        assert!(window_admits(s, e, 540));
        assert!(window_admits(s, e, 1019));
        assert!(!window_admits(s, e, 1020));
    }

    #[test]
    fn test_wrapping_window_is_continuous() {
        // 23:00 - 02:00 admits exactly [1380, 1440) ∪ [0, 120)
        let (s, e) = (1380, 120);
        for current in 0..1440 {
            let expected = current >= 1380 || current < 120;
            assert_eq!(window_admits(s, e, current), expected, "minute {current}");
        }
    }

    #[test]
    fn test_empty_window_admits_nothing() {
        // start == end is an empty same-day window
        for current in [0, 300, 719, 720, 721, 1439] {
            assert!(!window_admits(720, 720, current));
        }
    }

    #[test]
    fn test_disabled_filter_admits() {
        let filter = TimeWindowFilter::new(&TimeWindowConfig::default()).unwrap();
        assert!(filter.in_window());
    }

    #[test]
    fn test_full_day_window_admits() {
        let filter = TimeWindowFilter::new(&TimeWindowConfig {
            enabled: true,
            timezone: "UTC".into(),
            start_time: "00:00".into(),
            end_time: "23:59".into(),
        })
        .unwrap();
        // Could only fail during the 23:59 minute itself; accept either there
        let now = Utc::now();
        if now.hour() != 23 || now.minute() != 59 {
            assert!(filter.in_window());
        }
    }

    #[test]
    fn test_bad_timezone_rejected() {
        let result = TimeWindowFilter::new(&TimeWindowConfig {
            enabled: true,
            timezone: "Not/AZone".into(),
            start_time: "00:00".into(),
            end_time: "01:00".into(),
        });
        assert!(result.is_err());
    }
}
