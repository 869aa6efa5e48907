use time::{macros::format_description, OffsetDateTime};

pub fn now_micros() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000) as i64
}

pub fn from_micros(micros: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(micros as i128 * 1_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

/// Wall-clock `HH:MM` (UTC) shown next to a chat message.
pub fn format_hhmm(at: OffsetDateTime) -> String {
    at.format(format_description!("[hour]:[minute]"))
        .unwrap_or_else(|_| "--:--".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn micros_round_trip_keeps_precision() {
        let at = datetime!(2024-03-01 09:05:07.123456 UTC);
        let micros = (at.unix_timestamp_nanos() / 1_000) as i64;
        assert_eq!(from_micros(micros), at);
    }

    #[test]
    fn hhmm_is_zero_padded() {
        assert_eq!(format_hhmm(datetime!(2024-03-01 09:05 UTC)), "09:05");
        assert_eq!(format_hhmm(datetime!(2024-03-01 23:59:59 UTC)), "23:59");
    }
}
