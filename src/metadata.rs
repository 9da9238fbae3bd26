//! `Upload-Metadata` 头的解析与编码。
//!
//! 格式为逗号分隔的键值对，键与 Base64 编码的值之间用单个空格分隔；
//! 值可以省略。解析结果保持客户端给出的顺序。

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

const PAIR_SEPARATOR: &str = ",";
const KEY_VALUE_SEPARATOR: char = ' ';

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UploadMetadata {
    pairs: Vec<(String, Vec<u8>)>,
}

impl UploadMetadata {
    /// 解析请求头原文；空串得到空列表。
    pub fn parse(header: &str) -> Result<Self, String> {
        let mut pairs: Vec<(String, Vec<u8>)> = Vec::new();
        let header = header.trim();
        if header.is_empty() {
            return Ok(Self { pairs });
        }

        for item in header.split(PAIR_SEPARATOR) {
            let item = item.trim();
            let (key, encoded) = match item.split_once(KEY_VALUE_SEPARATOR) {
                Some((key, encoded)) => (key, Some(encoded)),
                None => (item, None),
            };
            if key.is_empty() || !key.is_ascii() {
                return Err(format!("invalid metadata key {key:?}"));
            }
            if pairs.iter().any(|(existing, _)| existing == key) {
                return Err(format!("duplicate metadata key {key:?}"));
            }
            let value = match encoded {
                Some(encoded) => STANDARD
                    .decode(encoded)
                    .map_err(|err| format!("metadata value for {key:?} is not base64: {err}"))?,
                None => Vec::new(),
            };
            pairs.push((key.to_string(), value));
        }

        Ok(Self { pairs })
    }

    /// 编码回请求头格式。
    pub fn encode(&self) -> String {
        self.pairs
            .iter()
            .map(|(key, value)| {
                if value.is_empty() {
                    key.clone()
                } else {
                    format!("{key}{KEY_VALUE_SEPARATOR}{}", STANDARD.encode(value))
                }
            })
            .collect::<Vec<_>>()
            .join(PAIR_SEPARATOR)
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.pairs
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value.as_slice())
    }

    /// 客户端声明的文件名（需为 UTF-8）。
    pub fn filename(&self) -> Option<&str> {
        self.get("filename")
            .and_then(|value| std::str::from_utf8(value).ok())
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }

    pub fn pairs(&self) -> &[(String, Vec<u8>)] {
        &self.pairs
    }
}
