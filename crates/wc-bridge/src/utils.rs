use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// JSON-RPC id for a call we originate: milliseconds since the epoch scaled by
/// 1000 plus a random suffix, so ids stay unique across restarts.
pub fn next_call_id() -> u64 {
    now_millis() * 1000 + rand::thread_rng().gen_range(0..1000)
}

/// Addresses are compared without regard to hex letter case.
pub fn same_account(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

pub fn contains_account(accounts: &[String], account: &str) -> bool {
    accounts.iter().any(|a| same_account(a, account))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_ids_are_time_scaled() {
        let before = now_millis() * 1000;
        let id = next_call_id();
        assert!(id >= before);
        assert!(id < (now_millis() + 1) * 1000);
    }

    #[test]
    fn test_account_match_ignores_case() {
        let accounts = vec!["0xAbCdEf".to_string()];
        assert!(contains_account(&accounts, "0xabcdef"));
        assert!(!contains_account(&accounts, "0xabcdee"));
    }
}
