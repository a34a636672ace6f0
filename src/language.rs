use regex_lite::Regex;
use std::sync::OnceLock;

/// 解析できない言語タグの代わりに使う既定値
pub const DEFAULT_LANGUAGE: &str = "en-US";

fn tag_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            // language[-script][-region]
            Regex::new(r"^([A-Za-z]{2,3})(?:[-_]([A-Za-z]{4}))?(?:[-_]([A-Za-z]{2}|[0-9]{3}))?$")
                .map_err(|e| log::error!("言語タグの正規表現が不正です: {}", e))
                .ok()
        })
        .as_ref()
}

/// 言語タグをBCP-47の正規形に変換
///
/// 言語は小文字、スクリプトは先頭のみ大文字、地域は大文字にそろえる。
/// 解析できない場合は `en-US` を返す。
///
/// # Examples
///
/// ```
/// # use call_transcribe::language::normalize;
/// assert_eq!(normalize("ja_jp"), "ja-JP");
/// assert_eq!(normalize("zh-hant-tw"), "zh-Hant-TW");
/// assert_eq!(normalize("not a tag"), "en-US");
/// ```
pub fn normalize(tag: &str) -> String {
    let Some(caps) = tag_pattern().and_then(|pattern| pattern.captures(tag.trim())) else {
        log::warn!("言語タグを解析できません。{} を使用します: {:?}", DEFAULT_LANGUAGE, tag);
        return DEFAULT_LANGUAGE.to_string();
    };

    let mut normalized = caps[1].to_ascii_lowercase();

    if let Some(script) = caps.get(2) {
        let script = script.as_str();
        normalized.push('-');
        normalized.push_str(&script[..1].to_ascii_uppercase());
        normalized.push_str(&script[1..].to_ascii_lowercase());
    }

    if let Some(region) = caps.get(3) {
        normalized.push('-');
        normalized.push_str(&region.as_str().to_ascii_uppercase());
    }

    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_valid_tags() {
        assert_eq!(normalize("en-US"), "en-US");
        assert_eq!(normalize("EN-us"), "en-US");
        assert_eq!(normalize("ja"), "ja");
        assert_eq!(normalize("es-419"), "es-419");
        assert_eq!(normalize(" ko-kr "), "ko-KR");
    }

    #[test]
    fn test_normalize_invalid_tags() {
        assert_eq!(normalize(""), DEFAULT_LANGUAGE);
        assert_eq!(normalize("english"), DEFAULT_LANGUAGE);
        assert_eq!(normalize("en-US-x-private-extra"), DEFAULT_LANGUAGE);
        assert_eq!(normalize("12-34"), DEFAULT_LANGUAGE);
    }

    #[test]
    fn test_tag_pattern_is_built() {
        assert!(tag_pattern().is_some());
        // 2回目も同じインスタンス
        assert!(std::ptr::eq(tag_pattern().unwrap(), tag_pattern().unwrap()));
    }
}
