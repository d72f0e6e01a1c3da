//! Client-side parameter binding for router admin statements.
//!
//! The router's admin interface only speaks the text protocol, so statements
//! cannot be prepared server-side. Every user-influenced value (hostnames,
//! user names, passwords) goes through [`AdminStatement::bind`] and is rendered
//! as an escaped literal; statement text itself is always a constant.

use std::fmt;

use crate::RouterError;

#[derive(Debug, Clone, PartialEq)]
pub enum AdminParam {
    Int(i64),
    Text(String),
}

impl From<i64> for AdminParam {
    fn from(v: i64) -> Self {
        AdminParam::Int(v)
    }
}

impl From<u32> for AdminParam {
    fn from(v: u32) -> Self {
        AdminParam::Int(i64::from(v))
    }
}

impl From<u16> for AdminParam {
    fn from(v: u16) -> Self {
        AdminParam::Int(i64::from(v))
    }
}

impl From<&str> for AdminParam {
    fn from(v: &str) -> Self {
        AdminParam::Text(v.to_string())
    }
}

impl From<String> for AdminParam {
    fn from(v: String) -> Self {
        AdminParam::Text(v)
    }
}

/// A statement with `?` placeholders and its bound parameters.
#[derive(Clone, PartialEq)]
pub struct AdminStatement {
    template: String,
    params: Vec<AdminParam>,
    /// Parameters that must not show up in logs.
    sensitive: bool,
}

impl AdminStatement {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            params: Vec::new(),
            sensitive: false,
        }
    }

    /// Shorthand for a statement without placeholders.
    pub fn plain(template: &str) -> Self {
        Self::new(template)
    }

    pub fn bind(mut self, param: impl Into<AdminParam>) -> Self {
        self.params.push(param.into());
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn params(&self) -> &[AdminParam] {
        &self.params
    }

    /// Substitutes every placeholder outside quoted literals. The number of
    /// placeholders must equal the number of bound parameters.
    pub fn render(&self) -> Result<String, RouterError> {
        let mut out = String::with_capacity(self.template.len() + 16 * self.params.len());
        let mut params = self.params.iter();
        let mut quote: Option<char> = None;

        for ch in self.template.chars() {
            match (quote, ch) {
                (Some(q), c) if c == q => {
                    quote = None;
                    out.push(c);
                }
                (Some(_), c) => out.push(c),
                (None, '\'') | (None, '"') => {
                    quote = Some(ch);
                    out.push(ch);
                }
                (None, '?') => {
                    let param = params.next().ok_or_else(|| {
                        RouterError::Binding(format!("too few parameters for: {}", self.template))
                    })?;
                    render_param(param, &mut out);
                }
                (None, c) => out.push(c),
            }
        }

        if params.next().is_some() {
            return Err(RouterError::Binding(format!(
                "too many parameters for: {}",
                self.template
            )));
        }
        Ok(out)
    }
}

impl fmt::Debug for AdminStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sensitive {
            write!(f, "AdminStatement({:?}, <redacted>)", self.template)
        } else {
            write!(f, "AdminStatement({:?}, {:?})", self.template, self.params)
        }
    }
}

fn render_param(param: &AdminParam, out: &mut String) {
    match param {
        AdminParam::Int(v) => out.push_str(&v.to_string()),
        AdminParam::Text(s) => {
            out.push('\'');
            for c in s.chars() {
                match c {
                    '\'' => out.push_str("''"),
                    '\\' => out.push_str("\\\\"),
                    '\0' => out.push_str("\\0"),
                    '\n' => out.push_str("\\n"),
                    '\r' => out.push_str("\\r"),
                    '\u{1a}' => out.push_str("\\Z"),
                    c => out.push(c),
                }
            }
            out.push('\'');
        }
    }
}

/// Container hostnames must be plain DNS labels joined by dots.
pub fn validate_hostname(hostname: &str) -> Result<(), RouterError> {
    let valid = !hostname.is_empty()
        && hostname.len() <= 253
        && hostname.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        });
    if valid {
        Ok(())
    } else {
        Err(RouterError::InvalidHostname(hostname.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binds_in_order() {
        let sql = AdminStatement::new(
            "REPLACE INTO mysql_servers (hostgroup_id, hostname, port) VALUES (?, ?, ?)",
        )
        .bind(10u32)
        .bind("dbc-1-primary")
        .bind(3306u16)
        .render()
        .unwrap();
        assert_eq!(
            sql,
            "REPLACE INTO mysql_servers (hostgroup_id, hostname, port) VALUES (10, 'dbc-1-primary', 3306)"
        );
    }

    #[test]
    fn test_quotes_are_escaped() {
        let sql = AdminStatement::new("DELETE FROM mysql_servers WHERE hostname = ?")
            .bind("x' OR '1'='1")
            .render()
            .unwrap();
        assert_eq!(sql, "DELETE FROM mysql_servers WHERE hostname = 'x'' OR ''1''=''1'");
    }

    #[test]
    fn test_backslash_cannot_break_out() {
        let sql = AdminStatement::new("SELECT ?").bind("a\\'; DROP").render().unwrap();
        assert_eq!(sql, "SELECT 'a\\\\''; DROP'");
    }

    #[test]
    fn test_placeholder_inside_literal_is_ignored() {
        let sql = AdminStatement::new("SELECT '?' , ?").bind(1i64).render().unwrap();
        assert_eq!(sql, "SELECT '?' , 1");
    }

    #[test]
    fn test_param_count_mismatch() {
        assert!(AdminStatement::new("SELECT ?, ?").bind(1i64).render().is_err());
        assert!(AdminStatement::new("SELECT 1").bind(1i64).render().is_err());
    }

    #[test]
    fn test_sensitive_debug_is_redacted() {
        let stmt = AdminStatement::new("SET ?").bind("hunter2").sensitive();
        assert!(!format!("{:?}", stmt).contains("hunter2"));
    }

    #[test]
    fn test_validate_hostname() {
        assert!(validate_hostname("dbc-1a2b3c4d-replica-2").is_ok());
        assert!(validate_hostname("db.internal").is_ok());
        assert!(validate_hostname("").is_err());
        assert!(validate_hostname("bad host").is_err());
        assert!(validate_hostname("x';--").is_err());
        assert!(validate_hostname("-leading").is_err());
    }
}
