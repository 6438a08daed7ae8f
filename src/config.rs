//! 연결 프로필 구성 및 검증
//!
//! 환경 변수(`DB_USER`, `DB_PASSWORD`, `DB_HOST`, `DB_NAME`)나 직접 전달된 필드로부터
//! 불변 `ConnectionProfile`을 만듭니다. I/O는 수행하지 않습니다.

use crate::error::{CdcError, Result};
use std::fmt;

pub const DEFAULT_CHARSET: &str = "utf8mb4";
pub const DEFAULT_COLLATION: &str = "utf8mb4_general_ci";
pub const DEFAULT_PORT: u16 = 3306;

/// 프로필 생성 입력값 (검증 전)
#[derive(Debug, Clone, Default)]
pub struct ProfileFields {
    pub user: String,
    pub password: String,
    pub host: String,
    pub database: String,
    pub charset: Option<String>,
    pub collation: Option<String>,
    pub port: Option<u16>,
}

impl ProfileFields {
    pub fn new(
        user: impl Into<String>,
        password: impl Into<String>,
        host: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        ProfileFields {
            user: user.into(),
            password: password.into(),
            host: host.into(),
            database: database.into(),
            ..Default::default()
        }
    }

    /// 키 조회 함수로부터 필드 구성. 없는 값은 빈 문자열이 됩니다.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = match lookup("DB_PORT").filter(|p| !p.is_empty()) {
            Some(raw) => Some(raw.parse::<u16>().map_err(|_| {
                CdcError::ValidationError(format!("DB_PORT is not a valid port: {}", raw))
            })?),
            None => None,
        };

        Ok(ProfileFields {
            user: lookup("DB_USER").unwrap_or_default(),
            password: lookup("DB_PASSWORD").unwrap_or_default(),
            host: lookup("DB_HOST").unwrap_or_default(),
            database: lookup("DB_NAME").unwrap_or_default(),
            charset: lookup("DB_CHARSET"),
            collation: lookup("DB_COLLATION"),
            port,
        })
    }
}

/// 검증된 MySQL 연결 프로필 (생성 후 불변)
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionProfile {
    user: String,
    password: String,
    host: String,
    database: String,
    charset: String,
    collation: String,
    port: u16,
}

impl ConnectionProfile {
    /// 필드 검증 후 기본값(charset/collation/port) 적용
    pub fn construct(fields: ProfileFields) -> Result<Self> {
        if fields.host.trim().is_empty() {
            return Err(CdcError::ValidationError("Host cannot be empty".to_string()));
        }
        if fields.database.trim().is_empty() {
            return Err(CdcError::ValidationError(
                "Database cannot be empty".to_string(),
            ));
        }
        if fields.port == Some(0) {
            return Err(CdcError::ValidationError("Port cannot be 0".to_string()));
        }

        Ok(ConnectionProfile {
            user: fields.user,
            password: fields.password,
            host: fields.host,
            database: fields.database,
            charset: non_empty_or(fields.charset, DEFAULT_CHARSET),
            collation: non_empty_or(fields.collation, DEFAULT_COLLATION),
            port: fields.port.unwrap_or(DEFAULT_PORT),
        })
    }

    /// 프로세스 환경 변수에서 프로필 생성
    pub fn from_env() -> Result<Self> {
        let fields = ProfileFields::from_lookup(|key| std::env::var(key).ok())?;
        Self::construct(fields)
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn charset(&self) -> &str {
        &self.charset
    }

    pub fn collation(&self) -> &str {
        &self.collation
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// 핸드셰이크에 사용할 collation id
    pub fn collation_id(&self) -> u8 {
        collation_id(&self.collation).unwrap_or(45)
    }
}

impl TryFrom<ProfileFields> for ConnectionProfile {
    type Error = CdcError;

    fn try_from(fields: ProfileFields) -> Result<Self> {
        ConnectionProfile::construct(fields)
    }
}

impl fmt::Debug for ConnectionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionProfile")
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("charset", &self.charset)
            .field("collation", &self.collation)
            .finish()
    }
}

fn non_empty_or(value: Option<String>, default: &str) -> String {
    value
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// 자주 쓰이는 collation 이름 → MySQL collation id
pub fn collation_id(name: &str) -> Option<u8> {
    let id = match name.to_ascii_lowercase().as_str() {
        "big5_chinese_ci" => 1,
        "latin1_swedish_ci" => 8,
        "ascii_general_ci" => 11,
        "utf8_general_ci" | "utf8mb3_general_ci" => 33,
        "utf8mb4_general_ci" => 45,
        "utf8mb4_bin" => 46,
        "latin1_bin" => 47,
        "binary" => 63,
        "utf8_bin" | "utf8mb3_bin" => 83,
        "utf8_unicode_ci" | "utf8mb3_unicode_ci" => 192,
        "utf8mb4_unicode_ci" => 224,
        "utf8mb4_0900_ai_ci" => 255,
        _ => return None,
    };
    Some(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_construct_applies_defaults() {
        let profile = ConnectionProfile::construct(ProfileFields::new("u", "p", "h", "d")).unwrap();
        assert_eq!(profile.user(), "u");
        assert_eq!(profile.password(), "p");
        assert_eq!(profile.host(), "h");
        assert_eq!(profile.database(), "d");
        assert_eq!(profile.charset(), "utf8mb4");
        assert_eq!(profile.collation(), "utf8mb4_general_ci");
        assert_eq!(profile.port(), 3306);
        assert_eq!(profile.collation_id(), 45);
    }

    #[test]
    fn test_construct_keeps_explicit_charset() {
        let mut fields = ProfileFields::new("u", "p", "h", "d");
        fields.charset = Some("latin1".to_string());
        fields.collation = Some("latin1_swedish_ci".to_string());
        fields.port = Some(3307);

        let profile = ConnectionProfile::try_from(fields).unwrap();
        assert_eq!(profile.charset(), "latin1");
        assert_eq!(profile.collation(), "latin1_swedish_ci");
        assert_eq!(profile.collation_id(), 8);
        assert_eq!(profile.port(), 3307);
    }

    #[test]
    fn test_empty_host_always_fails() {
        for host in ["", "   "] {
            let result = ConnectionProfile::construct(ProfileFields::new("u", "p", host, "d"));
            assert!(matches!(result, Err(CdcError::ValidationError(_))));
        }
    }

    #[test]
    fn test_empty_database_fails() {
        let result = ConnectionProfile::construct(ProfileFields::new("u", "p", "h", ""));
        assert!(matches!(result, Err(CdcError::ValidationError(_))));
    }

    #[test]
    fn test_empty_charset_counts_as_omitted() {
        let mut fields = ProfileFields::new("u", "p", "h", "d");
        fields.charset = Some(String::new());
        let profile = ConnectionProfile::construct(fields).unwrap();
        assert_eq!(profile.charset(), DEFAULT_CHARSET);
    }

    #[test]
    fn test_from_lookup_missing_values_fail_host_validation() {
        let fields = ProfileFields::from_lookup(|_| None).unwrap();
        assert_eq!(fields.host, "");
        assert!(matches!(
            ConnectionProfile::construct(fields),
            Err(CdcError::ValidationError(_))
        ));
    }

    #[test]
    fn test_from_lookup_reads_variables() {
        let vars: HashMap<&str, &str> = [
            ("DB_USER", "root"),
            ("DB_PASSWORD", "secret"),
            ("DB_HOST", "db.internal"),
            ("DB_NAME", "binlog_demo_db"),
            ("DB_PORT", "3310"),
        ]
        .into_iter()
        .collect();

        let fields = ProfileFields::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        let profile = ConnectionProfile::construct(fields).unwrap();
        assert_eq!(profile.host(), "db.internal");
        assert_eq!(profile.database(), "binlog_demo_db");
        assert_eq!(profile.port(), 3310);
    }

    #[test]
    fn test_from_lookup_rejects_bad_port() {
        let result = ProfileFields::from_lookup(|k| (k == "DB_PORT").then(|| "abc".to_string()));
        assert!(matches!(result, Err(CdcError::ValidationError(_))));
    }

    #[test]
    fn test_debug_redacts_password() {
        let profile =
            ConnectionProfile::construct(ProfileFields::new("u", "hunter2", "h", "d")).unwrap();
        let debug = format!("{:?}", profile);
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("hunter2"));
    }
}
