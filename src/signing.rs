use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Builds the `k=v&...` query string the exchange expects: every caller's
/// params plus `timestamp`, keys sorted lexicographically.
pub fn build_signed_query(secret_key: &str, mut params: Vec<(&str, String)>, timestamp_ms: i64) -> String {
    params.push(("timestamp", timestamp_ms.to_string()));
    params.sort_by(|a, b| a.0.cmp(b.0));

    let query: String = params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    let signature = sign(secret_key, &query);
    format!("{query}&signature={signature}")
}

/// Raw HMAC-SHA256 signature, hex-encoded, over an already-built query string.
pub fn sign(secret_key: &str, payload: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret_key.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_64_hex_chars() {
        let sig = sign("secret", "symbol=BTC-USDT&timestamp=1000");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn signature_is_deterministic() {
        let a = sign("secret", "a=1&b=2");
        let b = sign("secret", "a=1&b=2");
        assert_eq!(a, b);
    }

    #[test]
    fn build_signed_query_sorts_keys_and_appends_signature() {
        let params = vec![("symbol", "BTC-USDT".to_string()), ("side", "BUY".to_string())];
        let query = build_signed_query("secret", params, 1_700_000_000_000);
        assert!(query.starts_with("side=BUY&symbol=BTC-USDT&timestamp=1700000000000&signature="));
    }
}
