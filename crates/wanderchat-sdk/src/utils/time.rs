//! 时间处理工具
//!
//! - 业务层统一使用 UTC（`chrono::DateTime<Utc>`）
//! - 数值时间统一为毫秒时间戳

use chrono::{DateTime, TimeZone, Utc};

/// 当前 UTC 毫秒时间戳
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// 毫秒时间戳转 UTC 时间；越界时回退到 Unix 纪元
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_default()
}

/// 两个时间点相差的毫秒数（绝对值）
pub fn abs_diff_millis(a: &DateTime<Utc>, b: &DateTime<Utc>) -> i64 {
    (a.timestamp_millis() - b.timestamp_millis()).abs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_roundtrip_and_diff() {
        let a = from_millis(100);
        let b = from_millis(180);
        assert_eq!(a.timestamp_millis(), 100);
        assert_eq!(abs_diff_millis(&a, &b), 80);
        assert_eq!(abs_diff_millis(&b, &a), 80);
        assert!(now_millis() > 0);
    }
}
