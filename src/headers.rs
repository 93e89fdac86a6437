//! 大小写不敏感、保留插入顺序的标头表。
//!
//! 请求与响应共用同一个结构。名称在写入时统一转为小写，查找时同样转为小写，
//! 因此 `X-A` 与 `x-a` 指向同一个条目。

use crate::exception::Exception;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置标头，已存在的同名标头会被原位替换。
    pub fn set(&mut self, name: &str, value: &str) {
        let key = name.to_ascii_lowercase();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.entries.push((key, value.to_string())),
        }
    }

    /// 追加标头。同名标头重复出现时（例如请求中的多个 `Accept`）按逗号合并。
    pub fn append(&mut self, name: &str, value: &str) {
        let key = name.to_ascii_lowercase();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => {
                entry.1.push_str(", ");
                entry.1.push_str(value);
            }
            None => self.entries.push((key, value.to_string())),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        let key = name.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let key = name.to_ascii_lowercase();
        let index = self.entries.iter().position(|(k, _)| *k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 校验标头名称与值。
///
/// 名称必须是 RFC 7230 定义的 token，值中不允许出现 CR 或 LF，防止响应拆分。
pub fn validate(name: &str, value: &str) -> Result<(), Exception> {
    let name_ok = !name.is_empty()
        && name.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
        });
    if !name_ok || value.contains('\r') || value.contains('\n') {
        return Err(Exception::InvalidHeader(name.to_string()));
    }
    Ok(())
}
