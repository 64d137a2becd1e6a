//! 排除列表解析
//!
//! 每行一个路径前缀，`#` 开头为注释，空行忽略

use std::path::Path;

use super::env::ConfigError;

/// 解析排除列表文本，保持顺序并去重
pub fn parse_exclusions(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for line in text.lines() {
        let entry = line.trim();
        if entry.is_empty() || entry.starts_with('#') {
            continue;
        }
        push_unique(&mut out, entry);
    }
    out
}

/// 合并排除项（去重，保持首次出现的顺序）
pub fn push_unique(list: &mut Vec<String>, entry: &str) {
    if !list.iter().any(|e| e == entry) {
        list.push(entry.to_string());
    }
}

/// 读取排除列表文件
///
/// 文件不存在且未显式指定时返回空列表
pub fn load_exclusion_file(path: &Path, explicit: bool) -> Result<Vec<String>, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(parse_exclusions(&text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => Ok(Vec::new()),
        Err(e) => Err(ConfigError::ExcludeFile {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// 排除项必须为绝对路径前缀
pub fn validate_exclusions(list: &[String]) -> Result<(), ConfigError> {
    if list.is_empty() {
        return Err(ConfigError::invalid(
            "HERMIT_EXCLUDE_FILE",
            "",
            "exclusion set is empty",
        ));
    }
    if let Some(bad) = list.iter().find(|e| !e.starts_with('/')) {
        return Err(ConfigError::invalid(
            "HERMIT_EXCLUDE_PATHS",
            bad,
            "exclusions must be absolute path prefixes",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_ignores_comments_and_blanks() {
        let text = "# system\n/proc\n\n  /sys  \n/dev\n# dup\n/proc\n";
        assert_eq!(parse_exclusions(text), vec!["/proc", "/sys", "/dev"]);
    }

    #[test]
    fn test_missing_default_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exclude_list.txt");
        assert!(load_exclusion_file(&path, false).unwrap().is_empty());
        assert!(matches!(
            load_exclusion_file(&path, true),
            Err(ConfigError::ExcludeFile { .. })
        ));
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "/proc\n/etc/netplan").unwrap();
        let list = load_exclusion_file(file.path(), true).unwrap();
        assert_eq!(list, vec!["/proc", "/etc/netplan"]);
        assert!(validate_exclusions(&list).is_ok());
    }

    #[test]
    fn test_validate_rejects_relative_and_empty() {
        assert!(validate_exclusions(&[]).is_err());
        assert!(validate_exclusions(&["proc".to_string()]).is_err());
    }
}
