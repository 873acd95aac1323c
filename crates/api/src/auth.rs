//! 设备请求签名
//!
//! 设备注册时拿到证书，之后每个请求都带上时间戳和签名。签名是以证书为密钥、
//! 对规范化字符串计算的 HMAC-SHA256，十六进制编码。规范化字符串依次拼接
//! 设备编码、时间戳、证书，再按键名升序拼接各附加字段的 `key=value`。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use fleet_core::config::AuthConfig;
use fleet_core::{FleetError, FleetResult};
use hmac::{Hmac, Mac};
use metrics::counter;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// 参与签名的附加字段，键名有序
pub type SignedFields = BTreeMap<String, Value>;

#[derive(Debug, Clone)]
pub struct SignatureAuthenticator {
    replay_window_seconds: i64,
}

impl Default for SignatureAuthenticator {
    fn default() -> Self {
        Self::new(&AuthConfig::default())
    }
}

impl SignatureAuthenticator {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            replay_window_seconds: config.replay_window_seconds,
        }
    }

    /// 证书为 `SHA-256(设备编码 || 证书请求)` 的十六进制串，同样的输入得到同样的证书
    pub fn generate_certificate(device_code: &str, certificate_request: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(device_code.as_bytes());
        hasher.update(certificate_request.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn canonical_string(
        device_code: &str,
        timestamp: i64,
        certificate: &str,
        fields: &SignedFields,
    ) -> String {
        let mut canonical = format!("{device_code}{timestamp}{certificate}");
        for (key, value) in fields {
            canonical.push_str(key);
            canonical.push('=');
            canonical.push_str(&field_text(value));
        }
        canonical
    }

    /// 计算签名，设备端与测试使用
    pub fn sign(
        device_code: &str,
        timestamp: i64,
        certificate: &str,
        fields: &SignedFields,
    ) -> FleetResult<String> {
        let mut mac = new_mac(certificate)?;
        mac.update(Self::canonical_string(device_code, timestamp, certificate, fields).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    pub fn verify(
        &self,
        device_code: &str,
        timestamp: i64,
        certificate: Option<&str>,
        signature: &str,
        fields: &SignedFields,
    ) -> FleetResult<()> {
        self.verify_at(device_code, timestamp, certificate, signature, fields, Utc::now())
    }

    /// 先检查时间戳新鲜度，再校验签名；比较为常量时间
    pub fn verify_at(
        &self,
        device_code: &str,
        timestamp: i64,
        certificate: Option<&str>,
        signature: &str,
        fields: &SignedFields,
        now: DateTime<Utc>,
    ) -> FleetResult<()> {
        let skew = now.timestamp().saturating_sub(timestamp).saturating_abs();
        if skew > self.replay_window_seconds {
            return Err(reject(
                device_code,
                format!("请求时间戳已过期，偏差 {skew} 秒"),
            ));
        }

        let certificate = match certificate {
            Some(certificate) if !certificate.is_empty() => certificate,
            _ => return Err(reject(device_code, "设备尚未签发证书".to_string())),
        };

        let Ok(provided) = hex::decode(signature) else {
            return Err(reject(device_code, "签名格式错误".to_string()));
        };

        let mut mac = new_mac(certificate)?;
        mac.update(Self::canonical_string(device_code, timestamp, certificate, fields).as_bytes());
        mac.verify_slice(&provided)
            .map_err(|_| reject(device_code, "签名不匹配".to_string()))
    }
}

fn new_mac(certificate: &str) -> FleetResult<HmacSha256> {
    HmacSha256::new_from_slice(certificate.as_bytes())
        .map_err(|e| FleetError::Internal(format!("初始化HMAC失败: {e}")))
}

fn reject(device_code: &str, reason: String) -> FleetError {
    counter!("fleet_auth_failures_total").increment(1);
    warn!("设备 {} 认证失败: {}", device_code, reason);
    FleetError::Authentication(reason)
}

/// 字符串原样拼接，数组和对象按 JSON 编码
fn field_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(_) | Value::Number(_) | Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn fields() -> SignedFields {
        let mut fields = SignedFields::new();
        fields.insert("status".to_string(), json!("success"));
        fields.insert("instruction_id".to_string(), json!("i-1"));
        fields.insert("tags".to_string(), json!(["a", "b"]));
        fields
    }

    #[test]
    fn test_certificate_is_deterministic() {
        let a = SignatureAuthenticator::generate_certificate("D1", "nonce-1");
        let b = SignatureAuthenticator::generate_certificate("D1", "nonce-1");
        let c = SignatureAuthenticator::generate_certificate("D1", "nonce-2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_canonical_string_sorts_fields() {
        let canonical = SignatureAuthenticator::canonical_string("D1", 100, "cert", &fields());
        assert_eq!(
            canonical,
            r#"D1100certinstruction_id=i-1status=successtags=["a","b"]"#
        );
    }

    #[test]
    fn test_valid_signature_verifies() {
        let auth = SignatureAuthenticator::default();
        let ts = now().timestamp();
        let signature = SignatureAuthenticator::sign("D1", ts, "cert", &fields()).unwrap();

        auth.verify_at("D1", ts, Some("cert"), &signature, &fields(), now())
            .unwrap();
    }

    #[test]
    fn test_altered_field_fails() {
        let auth = SignatureAuthenticator::default();
        let ts = now().timestamp();
        let signature = SignatureAuthenticator::sign("D1", ts, "cert", &fields()).unwrap();

        let mut altered = fields();
        altered.insert("status".to_string(), json!("failed"));
        let err = auth
            .verify_at("D1", ts, Some("cert"), &signature, &altered, now())
            .unwrap_err();
        assert!(err.is_authentication());

        let err = auth
            .verify_at("D2", ts, Some("cert"), &signature, &fields(), now())
            .unwrap_err();
        assert!(err.is_authentication());
    }

    #[test]
    fn test_stale_timestamp_rejected_before_signature() {
        let auth = SignatureAuthenticator::default();
        let ts = now().timestamp() - 301;
        let signature = SignatureAuthenticator::sign("D1", ts, "cert", &fields()).unwrap();

        let err = auth
            .verify_at("D1", ts, Some("cert"), &signature, &fields(), now())
            .unwrap_err();
        assert!(err.to_string().contains("过期"));

        // 未来时间同样受窗口限制
        let future = now().timestamp() + 301;
        let err = auth
            .verify_at("D1", future, Some("cert"), "zz", &fields(), now())
            .unwrap_err();
        assert!(err.to_string().contains("过期"));
    }

    #[test]
    fn test_boundary_of_replay_window_accepted() {
        let auth = SignatureAuthenticator::default();
        let ts = now().timestamp() - 300;
        let signature = SignatureAuthenticator::sign("D1", ts, "cert", &fields()).unwrap();
        assert!(auth
            .verify_at("D1", ts, Some("cert"), &signature, &fields(), now())
            .is_ok());
    }

    #[test]
    fn test_missing_certificate_and_malformed_signature() {
        let auth = SignatureAuthenticator::default();
        let ts = now().timestamp();

        let err = auth
            .verify_at("D1", ts, None, "abcd", &fields(), now())
            .unwrap_err();
        assert!(err.is_authentication());

        let err = auth
            .verify_at("D1", ts, Some("cert"), "not-hex", &fields(), now())
            .unwrap_err();
        assert!(err.is_authentication());
    }
}
