//! Unit name derivation.
//!
//! Unit names are produced by literal substitution of `{USERNAME}`,
//! `{USERID}` and `{SERVERNAME}` placeholders into a caller-supplied
//! template; the template is never interpreted beyond that.  Server names
//! are escaped with the algorithm from `systemd.unit(5)` before they are
//! substituted, so the result is safe both as a template instance argument
//! and as a filesystem path component.

use crate::error::{Error, Result};

/// The longest unit name the service manager accepts.
pub const UNIT_NAME_MAX: usize = 256;

/// The values substituted into name and path templates.
#[derive(Debug, Clone, Copy)]
pub struct TemplateVars<'a> {
    /// Name of the end user.
    pub username: &'a str,
    /// Numeric id of the end user.
    pub user_id: u32,
    /// Escaped name of the named sub-server, if any.
    pub server_name: Option<&'a str>,
}

impl TemplateVars<'_> {
    /// Expand the recognized placeholders in `template`.
    ///
    /// `{SERVERNAME}` expands to the empty string when no server name is
    /// set, so a template written for named servers still yields a usable
    /// (if odd-looking) name for the default server.
    pub fn expand(&self, template: &str) -> String {
        template
            .replace("{USERNAME}", self.username)
            .replace("{USERID}", &self.user_id.to_string())
            .replace("{SERVERNAME}", self.server_name.unwrap_or(""))
    }
}

/// Expand `template` into a unit name and validate it.
pub fn resolve(template: &str, vars: &TemplateVars<'_>) -> Result<String> {
    let name = vars.expand(template);
    validate(&name)?;
    Ok(name)
}

/// Check a unit name against the manager's length limit.
///
/// Persisted names are re-checked through this on every start, since a
/// loaded name overrides the template-derived one.
pub fn validate(name: &str) -> Result<()> {
    if name.len() > UNIT_NAME_MAX {
        return Err(Error::UnitNameTooLong(name.to_owned()));
    }
    Ok(())
}

/// Insert `instance` into a template unit name.
///
/// `singleuser@.service` with instance `lab` becomes
/// `singleuser@lab.service`.  Names without a `@.` template marker are
/// returned unchanged.
pub fn instantiate(template: &str, instance: &str) -> String {
    match template.find("@.") {
        Some(at) => format!(
            "{}{}{}",
            &template[..=at],
            instance,
            &template[at + 1..]
        ),
        None => template.to_owned(),
    }
}

fn is_unescaped_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b':' || b == b'_' || b == b'.'
}

/// Escape a string the way the service manager escapes unit name
/// components (`systemd.unit(5)`): `/` becomes `-`, bytes outside
/// `[a-zA-Z0-9:_.]` become `\xHH`, a leading `.` is escaped, and the
/// empty string becomes `-`.
pub fn escape_name(name: &str) -> String {
    if name.is_empty() {
        return "-".to_owned();
    }
    let mut out = String::with_capacity(name.len());
    for (i, b) in name.bytes().enumerate() {
        if b == b'/' {
            out.push('-');
        } else if is_unescaped_byte(b) && !(i == 0 && b == b'.') {
            out.push(b as char);
        } else {
            out.push_str(&format!("\\x{b:02x}"));
        }
    }
    out
}

/// Reverse [escape_name].  Returns `None` on malformed escape sequences
/// or when the unescaped bytes are not valid UTF-8.
pub fn unescape_name(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'-' => {
                out.push(b'/');
                i += 1;
            }
            b'\\' => {
                if i + 3 >= bytes.len() || bytes[i + 1] != b'x' {
                    return None;
                }
                let hi = (bytes[i + 2] as char).to_digit(16)?;
                let lo = (bytes[i + 3] as char).to_digit(16)?;
                out.push((hi * 16 + lo) as u8);
                i += 4;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).ok()
}
