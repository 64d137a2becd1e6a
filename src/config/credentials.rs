//! SSH 首次连接口令
//!
//! 新开的节点池主机通常只开放口令登录。口令只用来把本机公钥装到目标机上，
//! 之后的探测、执行与传输一律走密钥认证。

use std::collections::BTreeMap;
use std::fmt;

use super::env::ConfigError;

/// 按主机解析的 SSH 口令
///
/// 查找顺序：命令行口令 → 按主机映射 → 通用口令
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SshPasswords {
    cli: Option<String>,
    per_host: BTreeMap<String, String>,
    common: Option<String>,
}

impl SshPasswords {
    /// 从 `HERMIT_SSH_PASSWORD` / `HERMIT_SSH_PASSWORD_MAP` 的值构造
    ///
    /// 映射格式为 `host1:pass1|host2:pass2`。`HERMIT_SSH_PASSWORD` 含 `|` 时也按映射解析，
    /// 否则视为所有主机共用的口令。
    pub fn parse(password: Option<&str>, map: Option<&str>) -> Result<Self, ConfigError> {
        let mut passwords = Self::default();

        if let Some(password) = password {
            if password.contains('|') {
                parse_map_into(&mut passwords.per_host, "HERMIT_SSH_PASSWORD", password)?;
            } else {
                passwords.common = Some(password.to_string());
            }
        }
        // 显式映射优先于 HERMIT_SSH_PASSWORD 中的同名主机
        if let Some(map) = map {
            parse_map_into(&mut passwords.per_host, "HERMIT_SSH_PASSWORD_MAP", map)?;
        }

        Ok(passwords)
    }

    /// 命令行 `--password` 覆盖所有来源
    pub fn with_override(mut self, password: impl Into<String>) -> Self {
        self.cli = Some(password.into());
        self
    }

    pub fn password_for(&self, address: &str) -> Option<&str> {
        self.cli
            .as_deref()
            .or_else(|| self.per_host.get(address).map(String::as_str))
            .or(self.common.as_deref())
    }

    pub fn is_empty(&self) -> bool {
        self.cli.is_none() && self.per_host.is_empty() && self.common.is_none()
    }
}

fn parse_map_into(
    into: &mut BTreeMap<String, String>,
    key: &str,
    raw: &str,
) -> Result<(), ConfigError> {
    for entry in raw.split('|').map(str::trim).filter(|e| !e.is_empty()) {
        let (host, password) = entry
            .split_once(':')
            .ok_or_else(|| ConfigError::invalid(key, "<redacted>", "expected host:password entries"))?;
        let host = host.trim();
        if host.is_empty() || password.is_empty() {
            return Err(ConfigError::invalid(
                key,
                "<redacted>",
                "expected host:password entries",
            ));
        }
        into.insert(host.to_string(), password.to_string());
    }
    Ok(())
}

// 口令不进日志
impl fmt::Debug for SshPasswords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshPasswords")
            .field("cli", &self.cli.as_ref().map(|_| "<redacted>"))
            .field("hosts", &self.per_host.keys().collect::<Vec<_>>())
            .field("common", &self.common.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_password_applies_to_every_host() {
        let passwords = SshPasswords::parse(Some("s3cret"), None).unwrap();
        assert_eq!(passwords.password_for("10.0.0.2"), Some("s3cret"));
        assert_eq!(passwords.password_for("10.0.0.3"), Some("s3cret"));
    }

    #[test]
    fn test_piped_password_is_a_map() {
        let passwords = SshPasswords::parse(Some("10.0.0.2:a|10.0.0.3:b"), None).unwrap();
        assert_eq!(passwords.password_for("10.0.0.2"), Some("a"));
        assert_eq!(passwords.password_for("10.0.0.3"), Some("b"));
        // 映射格式下没有通用口令
        assert_eq!(passwords.password_for("10.0.0.4"), None);
    }

    #[test]
    fn test_map_wins_over_common_password() {
        let passwords =
            SshPasswords::parse(Some("common"), Some("10.0.0.2:special|10.0.0.3:x:y")).unwrap();
        assert_eq!(passwords.password_for("10.0.0.2"), Some("special"));
        // 只按第一个冒号切分
        assert_eq!(passwords.password_for("10.0.0.3"), Some("x:y"));
        assert_eq!(passwords.password_for("10.0.0.9"), Some("common"));
    }

    #[test]
    fn test_cli_override_wins() {
        let passwords = SshPasswords::parse(Some("common"), Some("10.0.0.2:special"))
            .unwrap()
            .with_override("typed");
        assert_eq!(passwords.password_for("10.0.0.2"), Some("typed"));
        assert_eq!(passwords.password_for("10.0.0.9"), Some("typed"));
    }

    #[test]
    fn test_malformed_map_entry_rejected() {
        assert!(SshPasswords::parse(None, Some("10.0.0.2")).is_err());
        assert!(SshPasswords::parse(None, Some(":pw")).is_err());
        assert!(SshPasswords::parse(None, Some("10.0.0.2:")).is_err());
    }

    #[test]
    fn test_debug_redacts_passwords() {
        let passwords = SshPasswords::parse(Some("hunter2"), Some("10.0.0.2:special"))
            .unwrap()
            .with_override("typed");
        let rendered = format!("{passwords:?}");
        assert!(rendered.contains("10.0.0.2"));
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("special"));
        assert!(!rendered.contains("typed"));
    }

    #[test]
    fn test_empty() {
        assert!(SshPasswords::parse(None, None).unwrap().is_empty());
        assert!(!SshPasswords::default().with_override("x").is_empty());
    }
}
