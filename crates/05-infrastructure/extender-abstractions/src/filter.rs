//! 属性过滤表达式
//!
//! 支持 LDAP 风格的语法：`(&(objectClass=Greeter)(service.ranking>=10))`、
//! `(|(a=1)(b=*))`、`(!(extender.hidden=true))`、子串通配 `(name=gree*er)`
//! 以及近似匹配 `(name~=Hello World)`。属性名不区分大小写。

use extender_common::{FilterError, Properties};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// 比较运算符
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Equal,
    Approx,
    GreaterEq,
    LessEq,
}

/// 过滤表达式
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// 全部子表达式匹配
    And(Vec<Filter>),
    /// 任一子表达式匹配
    Or(Vec<Filter>),
    /// 子表达式不匹配
    Not(Box<Filter>),
    /// 属性存在 `(key=*)`
    Present { key: String },
    /// 相等 `(key=value)`
    Equal { key: String, value: String },
    /// 近似相等 `(key~=value)`，忽略大小写与空白
    Approx { key: String, value: String },
    /// 大于等于 `(key>=value)`
    GreaterEq { key: String, value: String },
    /// 小于等于 `(key<=value)`
    LessEq { key: String, value: String },
    /// 子串通配 `(key=a*b*c)`
    Substring {
        key: String,
        segments: Vec<String>,
        pattern: glob::Pattern,
    },
}

impl Filter {
    /// 解析过滤表达式
    pub fn parse(source: &str) -> Result<Self, FilterError> {
        if source.trim().is_empty() {
            return Err(FilterError::Empty);
        }
        let mut parser = Parser::new(source);
        let filter = parser.parse_filter()?;
        parser.skip_whitespace();
        if parser.pos < parser.chars.len() {
            return Err(FilterError::syntax(parser.pos, "表达式结束后存在多余字符"));
        }
        Ok(filter)
    }

    /// 相等过滤器
    pub fn equal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Equal {
            key: key.into(),
            value: value.into(),
        }
    }

    /// 存在性过滤器
    pub fn present(key: impl Into<String>) -> Self {
        Self::Present { key: key.into() }
    }

    /// 取交集，单个元素时直接返回该元素
    pub fn all(mut filters: Vec<Self>) -> Self {
        if filters.len() == 1 {
            filters.remove(0)
        } else {
            Self::And(filters)
        }
    }

    /// 检查属性集合是否匹配
    pub fn matches(&self, properties: &Properties) -> bool {
        match self {
            Self::And(filters) => filters.iter().all(|f| f.matches(properties)),
            Self::Or(filters) => filters.iter().any(|f| f.matches(properties)),
            Self::Not(filter) => !filter.matches(properties),
            Self::Present { key } => lookup(properties, key).is_some(),
            Self::Equal { key, value } => {
                compare_property(properties, key, value, Comparison::Equal)
            }
            Self::Approx { key, value } => {
                compare_property(properties, key, value, Comparison::Approx)
            }
            Self::GreaterEq { key, value } => {
                compare_property(properties, key, value, Comparison::GreaterEq)
            }
            Self::LessEq { key, value } => {
                compare_property(properties, key, value, Comparison::LessEq)
            }
            Self::Substring { key, pattern, .. } => lookup(properties, key)
                .map(|value| substring_matches(value, pattern))
                .unwrap_or(false),
        }
    }
}

impl FromStr for Filter {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And(filters) => {
                f.write_str("(&")?;
                for filter in filters {
                    write!(f, "{}", filter)?;
                }
                f.write_str(")")
            }
            Self::Or(filters) => {
                f.write_str("(|")?;
                for filter in filters {
                    write!(f, "{}", filter)?;
                }
                f.write_str(")")
            }
            Self::Not(filter) => write!(f, "(!{})", filter),
            Self::Present { key } => write!(f, "({}=*)", key),
            Self::Equal { key, value } => write!(f, "({}={})", key, escape(value)),
            Self::Approx { key, value } => write!(f, "({}~={})", key, escape(value)),
            Self::GreaterEq { key, value } => write!(f, "({}>={})", key, escape(value)),
            Self::LessEq { key, value } => write!(f, "({}<={})", key, escape(value)),
            Self::Substring { key, segments, .. } => {
                let joined = segments
                    .iter()
                    .map(|s| escape(s))
                    .collect::<Vec<_>>()
                    .join("*");
                write!(f, "({}={})", key, joined)
            }
        }
    }
}

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '(' | ')' | '*') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn lookup<'a>(properties: &'a Properties, key: &str) -> Option<&'a Value> {
    properties
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v)
}

fn compare_property(properties: &Properties, key: &str, expected: &str, op: Comparison) -> bool {
    lookup(properties, key)
        .map(|value| value_matches(value, expected, op))
        .unwrap_or(false)
}

fn value_matches(value: &Value, expected: &str, op: Comparison) -> bool {
    match value {
        Value::Array(items) => items.iter().any(|item| value_matches(item, expected, op)),
        Value::String(actual) => match op {
            Comparison::Equal => actual == expected,
            Comparison::Approx => normalize(actual) == normalize(expected),
            Comparison::GreaterEq => actual.as_str() >= expected,
            Comparison::LessEq => actual.as_str() <= expected,
        },
        Value::Number(number) => {
            let expected = expected.trim();
            let ordering = if let (Some(actual), Ok(expected)) =
                (number.as_i64(), expected.parse::<i64>())
            {
                Some(actual.cmp(&expected))
            } else if let (Some(actual), Ok(expected)) =
                (number.as_f64(), expected.parse::<f64>())
            {
                actual.partial_cmp(&expected)
            } else {
                None
            };
            ordering.map_or(false, |ordering| ordering_matches(ordering, op))
        }
        Value::Bool(actual) => match op {
            Comparison::Equal | Comparison::Approx => expected
                .trim()
                .parse::<bool>()
                .map_or(false, |expected| expected == *actual),
            _ => false,
        },
        Value::Null | Value::Object(_) => false,
    }
}

fn ordering_matches(ordering: Ordering, op: Comparison) -> bool {
    match op {
        Comparison::Equal | Comparison::Approx => ordering == Ordering::Equal,
        Comparison::GreaterEq => ordering != Ordering::Less,
        Comparison::LessEq => ordering != Ordering::Greater,
    }
}

fn substring_matches(value: &Value, pattern: &glob::Pattern) -> bool {
    match value {
        Value::String(actual) => pattern.matches(actual),
        Value::Array(items) => items.iter().any(|item| substring_matches(item, pattern)),
        _ => false,
    }
}

fn normalize(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while self.peek().map_or(false, char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), FilterError> {
        match self.peek() {
            Some(c) if c == expected => {
                self.pos += 1;
                Ok(())
            }
            Some(c) => Err(FilterError::syntax(
                self.pos,
                format!("期望 '{}'，实际为 '{}'", expected, c),
            )),
            None => Err(FilterError::syntax(
                self.pos,
                format!("期望 '{}'，表达式提前结束", expected),
            )),
        }
    }

    fn parse_filter(&mut self) -> Result<Filter, FilterError> {
        self.skip_whitespace();
        self.expect('(')?;
        self.skip_whitespace();

        let filter = match self.peek() {
            Some('&') => {
                self.pos += 1;
                Filter::And(self.parse_list()?)
            }
            Some('|') => {
                self.pos += 1;
                Filter::Or(self.parse_list()?)
            }
            Some('!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.parse_filter()?))
            }
            Some(_) => self.parse_item()?,
            None => return Err(FilterError::syntax(self.pos, "表达式提前结束")),
        };

        self.skip_whitespace();
        self.expect(')')?;
        Ok(filter)
    }

    fn parse_list(&mut self) -> Result<Vec<Filter>, FilterError> {
        let mut filters = Vec::new();
        loop {
            self.skip_whitespace();
            if self.peek() == Some('(') {
                filters.push(self.parse_filter()?);
            } else {
                break;
            }
        }
        if filters.is_empty() {
            return Err(FilterError::syntax(self.pos, "组合表达式至少需要一个子表达式"));
        }
        Ok(filters)
    }

    fn parse_item(&mut self) -> Result<Filter, FilterError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if matches!(c, '=' | '<' | '>' | '~' | '(' | ')') {
                break;
            }
            self.pos += 1;
        }
        let key: String = self.chars[start..self.pos].iter().collect();
        let key = key.trim().to_string();
        if key.is_empty() {
            return Err(FilterError::syntax(start, "缺少属性名"));
        }

        let op = match self.peek() {
            Some('=') => {
                self.pos += 1;
                Comparison::Equal
            }
            Some('~') => {
                self.pos += 1;
                self.expect('=')?;
                Comparison::Approx
            }
            Some('>') => {
                self.pos += 1;
                self.expect('=')?;
                Comparison::GreaterEq
            }
            Some('<') => {
                self.pos += 1;
                self.expect('=')?;
                Comparison::LessEq
            }
            _ => return Err(FilterError::syntax(self.pos, "缺少比较运算符")),
        };

        let segments = self.parse_value()?;

        match op {
            Comparison::Equal if segments.len() == 1 => Ok(Filter::Equal {
                key,
                value: segments.concat(),
            }),
            Comparison::Equal if segments.iter().all(String::is_empty) && segments.len() == 2 => {
                Ok(Filter::Present { key })
            }
            Comparison::Equal => {
                let glob_source = segments
                    .iter()
                    .map(|s| glob::Pattern::escape(s))
                    .collect::<Vec<_>>()
                    .join("*");
                let pattern = glob::Pattern::new(&glob_source)
                    .map_err(|e| FilterError::syntax(self.pos, e.msg))?;
                Ok(Filter::Substring {
                    key,
                    segments,
                    pattern,
                })
            }
            Comparison::Approx => Ok(Filter::Approx {
                key,
                value: segments.join("*"),
            }),
            Comparison::GreaterEq => Ok(Filter::GreaterEq {
                key,
                value: segments.join("*"),
            }),
            Comparison::LessEq => Ok(Filter::LessEq {
                key,
                value: segments.join("*"),
            }),
        }
    }

    /// 读取值直到未转义的 ')'，按未转义的 '*' 切分
    fn parse_value(&mut self) -> Result<Vec<String>, FilterError> {
        let mut segments = vec![String::new()];
        loop {
            match self.peek() {
                Some(')') => break,
                Some('(') => {
                    return Err(FilterError::syntax(self.pos, "值中存在未转义的 '('"));
                }
                Some('\\') => {
                    self.pos += 1;
                    let escaped = self
                        .peek()
                        .ok_or_else(|| FilterError::syntax(self.pos, "转义符后缺少字符"))?;
                    if let Some(current) = segments.last_mut() {
                        current.push(escaped);
                    }
                    self.pos += 1;
                }
                Some('*') => {
                    segments.push(String::new());
                    self.pos += 1;
                }
                Some(c) => {
                    if let Some(current) = segments.last_mut() {
                        current.push(c);
                    }
                    self.pos += 1;
                }
                None => return Err(FilterError::syntax(self.pos, "值未以 ')' 结束")),
            }
        }
        Ok(segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(pairs: &[(&str, Value)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_parse_equal_and_present() {
        assert_eq!(
            Filter::parse("(objectClass=Greeter)").unwrap(),
            Filter::equal("objectClass", "Greeter")
        );
        assert_eq!(
            Filter::parse(" ( extender.owner=* ) ").unwrap(),
            Filter::present("extender.owner")
        );
    }

    #[test]
    fn test_composite_matching() {
        let filter =
            Filter::parse("(&(objectClass=Greeter)(|(lang=en)(lang=fr))(!(hidden=true)))")
                .unwrap();

        let visible = props(&[
            ("objectClass", json!(["Greeter", "Logger"])),
            ("lang", json!("fr")),
        ]);
        assert!(filter.matches(&visible));

        let hidden = props(&[
            ("objectClass", json!(["Greeter"])),
            ("lang", json!("en")),
            ("hidden", json!(true)),
        ]);
        assert!(!filter.matches(&hidden));
    }

    #[test]
    fn test_numeric_comparison() {
        let filter = Filter::parse("(service.ranking>=10)").unwrap();
        assert!(filter.matches(&props(&[("service.ranking", json!(10))])));
        assert!(filter.matches(&props(&[("service.ranking", json!(11.5))])));
        assert!(!filter.matches(&props(&[("service.ranking", json!(3))])));
        assert!(!filter.matches(&props(&[])));

        let filter = Filter::parse("(service.ranking<=0)").unwrap();
        assert!(filter.matches(&props(&[("service.ranking", json!(-4))])));
    }

    #[test]
    fn test_substring_and_approx() {
        let filter = Filter::parse("(name=gree*er)").unwrap();
        assert!(filter.matches(&props(&[("name", json!("greeter"))])));
        assert!(!filter.matches(&props(&[("name", json!("grader"))])));

        let filter = Filter::parse("(name~=Hello World)").unwrap();
        assert!(filter.matches(&props(&[("name", json!("helloworld"))])));
    }

    #[test]
    fn test_keys_are_case_insensitive() {
        let filter = Filter::parse("(OBJECTCLASS=Greeter)").unwrap();
        assert!(filter.matches(&props(&[("objectClass", json!("Greeter"))])));
    }

    #[test]
    fn test_escaped_characters() {
        let filter = Filter::parse(r"(path=a\*b\(c\))").unwrap();
        assert_eq!(filter, Filter::equal("path", "a*b(c)"));
        assert_eq!(filter.to_string(), r"(path=a\*b\(c\))");
        assert!(filter.matches(&props(&[("path", json!("a*b(c)"))])));
    }

    #[test]
    fn test_display_round_trip() {
        let source = "(&(a=1)(|(b=*)(c>=2))(!(d~=x y)))";
        let filter = Filter::parse(source).unwrap();
        assert_eq!(Filter::parse(&filter.to_string()).unwrap(), filter);
    }

    #[test]
    fn test_syntax_errors() {
        assert_eq!(Filter::parse(""), Err(FilterError::Empty));
        assert!(matches!(
            Filter::parse("objectClass=Greeter"),
            Err(FilterError::Syntax { position: 0, .. })
        ));
        assert!(Filter::parse("(objectClass=Greeter").is_err());
        assert!(Filter::parse("(&)").is_err());
        assert!(Filter::parse("(=value)").is_err());
        assert!(Filter::parse("(a=1))").is_err());
        assert!(Filter::parse("(a>1)").is_err());
    }
}
