//! # 路由模板编译模块
//!
//! 将形如 `/items/:id`、`/files/*` 的路由模板编译为正则表达式，并记录参数名的声明顺序。
//!
//! ## 模板语法
//! - 字面量片段按原样匹配（默认大小写不敏感）。
//! - `:name` 捕获单个路径片段（不含 `/`）。
//! - `:name?` 使该片段可选，未匹配时对应的值为 `None`。
//! - `:name(regex)` 以内联正则替换默认的捕获表达式，内联正则中不允许出现捕获组。
//! - `*` 捕获剩余的全部路径（可包含 `/`），参数名固定为 `*`。
//! - 末尾的 `/` 总是可选的。

use std::fmt;

use log::debug;
use regex::{Regex, RegexBuilder};

use crate::exception::Exception;

/// 通配符对应的参数名
pub const WILDCARD_KEY: &str = "*";

/// 默认的单片段捕获表达式
const SEGMENT_CAPTURE: &str = "[^/]+?";

/// 编译后的路由模板。创建后不可变。
#[derive(Debug, Clone)]
pub struct RoutePattern {
    template: String,
    regex: Regex,
    keys: Vec<String>,
    case_sensitive: bool,
}

#[derive(Debug, PartialEq)]
enum Token {
    Literal(String),
    Param {
        name: String,
        capture: Option<String>,
        optional: bool,
    },
    Wildcard,
}

impl RoutePattern {
    /// 编译路由模板。
    ///
    /// # 错误处理
    /// 模板格式非法（参数名为空、括号不匹配、内联正则非法或含捕获组）时返回
    /// `Exception::PatternError`。
    pub fn compile(template: &str, case_sensitive: bool) -> Result<Self, Exception> {
        let pattern_error = |reason: &str| Exception::PatternError {
            template: template.to_string(),
            reason: reason.to_string(),
        };

        let mut source = String::from("^");
        let mut keys = Vec::new();

        for segment in split_segments(template).map_err(|r| pattern_error(&r))? {
            let tokens = tokenize(&segment).map_err(|r| pattern_error(&r))?;

            // 整个片段只有一个可选参数时，连同前面的斜杠一起变为可选
            if let [Token::Param {
                name,
                capture,
                optional: true,
            }] = tokens.as_slice()
            {
                let capture = capture.as_deref().unwrap_or(SEGMENT_CAPTURE);
                source.push_str(&format!("(?:/({}))?", capture));
                keys.push(name.clone());
                continue;
            }

            source.push('/');
            for token in tokens {
                match token {
                    Token::Literal(text) => source.push_str(&regex::escape(&text)),
                    Token::Param {
                        name,
                        capture,
                        optional,
                    } => {
                        let capture = capture.as_deref().unwrap_or(SEGMENT_CAPTURE);
                        source.push_str(&format!("({})", capture));
                        if optional {
                            source.push('?');
                        }
                        keys.push(name);
                    }
                    Token::Wildcard => {
                        source.push_str("(.*)");
                        keys.push(WILDCARD_KEY.to_string());
                    }
                }
            }
        }
        source.push_str("/?$");

        let regex = RegexBuilder::new(&source)
            .case_insensitive(!case_sensitive)
            .build()
            .map_err(|e| pattern_error(&e.to_string()))?;

        // 捕获组数量必须与参数名数量一一对应
        if regex.captures_len() - 1 != keys.len() {
            return Err(pattern_error(
                "inline sub-patterns must not contain capturing groups",
            ));
        }

        debug!("路由模板 {} 编译为 {}", template, source);
        Ok(Self {
            template: template.to_string(),
            regex,
            keys,
            case_sensitive,
        })
    }

    /// 匹配任意路径的模板，未指定路径的中间件使用它。
    pub fn any() -> Self {
        Self {
            template: WILDCARD_KEY.to_string(),
            regex: Regex::new("^/(.*)/?$").expect("wildcard pattern is a valid regex"),
            keys: vec![WILDCARD_KEY.to_string()],
            case_sensitive: false,
        }
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    /// 匹配具体路径，返回与 `keys()` 一一对应的捕获值。
    ///
    /// 未参与匹配的可选参数对应 `None`；不匹配时返回 `None`。
    pub fn captures(&self, path: &str) -> Option<Vec<Option<String>>> {
        let caps = self.regex.captures(path)?;
        Some(
            (1..=self.keys.len())
                .map(|i| caps.get(i).map(|m| m.as_str().to_string()))
                .collect(),
        )
    }

    /// 参数名，按声明顺序排列
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn is_case_sensitive(&self) -> bool {
        self.case_sensitive
    }
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.template)
    }
}

/// 按 `/` 切分模板，内联正则括号内部的 `/` 不参与切分。
fn split_segments(template: &str) -> Result<Vec<String>, String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut escaped = false;

    for c in template.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if depth > 0 => {
                current.push(c);
                escaped = true;
            }
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                if depth == 0 {
                    return Err("unbalanced `)`".to_string());
                }
                depth -= 1;
                current.push(c);
            }
            '/' if depth == 0 => segments.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if depth != 0 {
        return Err("unbalanced `(`".to_string());
    }
    segments.push(current);

    // 前导斜杠产生的空片段、末尾斜杠以及重复斜杠都不构成片段
    Ok(segments.into_iter().filter(|s| !s.is_empty()).collect())
}

fn tokenize(segment: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = segment.chars().collect();
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            ':' => {
                if !literal.is_empty() {
                    tokens.push(Token::Literal(std::mem::take(&mut literal)));
                }
                i += 1;
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                if i == start {
                    return Err("empty parameter name".to_string());
                }
                let name: String = chars[start..i].iter().collect();

                let mut capture = None;
                if i < chars.len() && chars[i] == '(' {
                    let (inner, next) = read_group(&chars, i)?;
                    capture = Some(inner);
                    i = next;
                }

                let optional = i < chars.len() && chars[i] == '?';
                if optional {
                    i += 1;
                }
                tokens.push(Token::Param {
                    name,
                    capture,
                    optional,
                });
            }
            '*' => {
                if !literal.is_empty() {
                    tokens.push(Token::Literal(std::mem::take(&mut literal)));
                }
                tokens.push(Token::Wildcard);
                i += 1;
            }
            c => {
                literal.push(c);
                i += 1;
            }
        }
    }
    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    Ok(tokens)
}

/// 读取从 `open` 位置开始的括号组，返回括号内的内容与括号之后的位置。
fn read_group(chars: &[char], open: usize) -> Result<(String, usize), String> {
    let mut depth = 0usize;
    let mut i = open;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 1,
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    let inner: String = chars[open + 1..i].iter().collect();
                    if inner.is_empty() {
                        return Err("empty inline pattern".to_string());
                    }
                    return Ok((inner, i + 1));
                }
            }
            _ => {}
        }
        i += 1;
    }
    Err("unbalanced `(`".to_string())
}
