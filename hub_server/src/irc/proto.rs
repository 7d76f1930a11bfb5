//! IRC line parsing and formatting (the RFC 1459 subset the bridge speaks).

use std::fmt;

/// An IRC message prefix: `nick!user@host`, or a bare server name.
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct Prefix
{
    pub name: String,
    pub user: String,
    pub host: String,
}

impl Prefix
{
    pub fn server(name: impl Into<String>) -> Self
    {
        Self {
            name: name.into(),
            user: String::new(),
            host: String::new(),
        }
    }

    pub fn user(name: impl Into<String>, user: impl Into<String>, host: impl Into<String>) -> Self
    {
        Self {
            name: name.into(),
            user: user.into(),
            host: host.into(),
        }
    }
}

impl fmt::Display for Prefix
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        f.write_str(&self.name)?;
        if !self.user.is_empty() {
            write!(f, "!{}", self.user)?;
        }
        if !self.host.is_empty() {
            write!(f, "@{}", self.host)?;
        }
        Ok(())
    }
}

/// One IRC protocol line, parsed or to be formatted.
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct Message
{
    pub prefix: Option<Prefix>,
    pub command: String,
    pub params: Vec<String>,
}

impl Message
{
    pub fn new(command: impl Into<String>, params: Vec<String>) -> Self
    {
        Self {
            prefix: None,
            command: command.into(),
            params,
        }
    }

    pub fn with_prefix(prefix: Prefix, command: impl Into<String>, params: Vec<String>) -> Self
    {
        Self {
            prefix: Some(prefix),
            command: command.into(),
            params,
        }
    }

    /// Parses one line, without its CR/LF. Returns `None` for blank lines.
    pub fn parse(raw: &str) -> Option<Self>
    {
        let mut raw = raw.trim_start();
        if raw.is_empty()
        {
            return None;
        }

        let mut prefix = None;
        if let Some(rest) = raw.strip_prefix(':') {
            let offset = rest.find(' ')?;
            prefix = Some(parse_prefix(&rest[..offset]));
            raw = rest[offset + 1 ..].trim_start();
            if raw.is_empty() {
                return None;
            }
        }

        let (command, mut rest) = match raw.find(' ') {
            None => {
                return Some(Self {
                    prefix,
                    command: raw.to_string(),
                    params: Vec::new(),
                });
            }
            Some(offset) => (&raw[..offset], &raw[offset + 1 ..]),
        };

        let mut params = Vec::new();
        loop {
            if let Some(trailing) = rest.strip_prefix(':') {
                if !trailing.is_empty() {
                    params.push(trailing.to_string());
                }
                break;
            }
            match rest.find(' ') {
                Some(offset) => {
                    let arg = &rest[..offset];
                    if !arg.is_empty() {
                        params.push(arg.to_string());
                    }
                    rest = &rest[offset + 1 ..];
                }
                None => {
                    if !rest.is_empty() {
                        params.push(rest.to_string());
                    }
                    break;
                }
            }
        }

        Some(Self {
            prefix,
            command: command.to_string(),
            params,
        })
    }

    /// Formats the line, without CR/LF.
    ///
    /// The final parameter is written as a trailing (`:`-prefixed) argument
    /// whenever the message has more than one, or when it could not be read
    /// back otherwise.
    pub fn to_line(&self) -> String
    {
        let mut out = String::new();
        if let Some(prefix) = &self.prefix {
            out.push(':');
            out.push_str(&prefix.to_string());
            out.push(' ');
        }
        out.push_str(&self.command);
        if let Some((last, head)) = self.params.split_last() {
            for arg in head {
                out.push(' ');
                out.push_str(arg);
            }
            let needs_colon = !head.is_empty()
                || last.is_empty()
                || last.contains(' ')
                || last.starts_with(':');
            out.push(' ');
            if needs_colon {
                out.push(':');
            }
            out.push_str(last);
        }
        out
    }
}

fn parse_prefix(raw: &str) -> Prefix
{
    let (name_user, host) = match raw.find('@') {
        Some(at) => (&raw[..at], &raw[at + 1 ..]),
        None => (raw, ""),
    };
    let (name, user) = match name_user.find('!') {
        Some(bang) => (&name_user[..bang], &name_user[bang + 1 ..]),
        None => (name_user, ""),
    };
    Prefix {
        name: name.to_string(),
        user: user.to_string(),
        host: host.to_string(),
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn no_args()
    {
        let msg = Message::parse("QUIT").unwrap();
        assert_eq!(msg.command, "QUIT");
        assert_eq!(msg.params.len(), 0);
        assert!(msg.prefix.is_none());
    }

    #[test]
    fn simple_args()
    {
        let msg = Message::parse("USER alice 0 * :Alice Example").unwrap();
        assert_eq!(msg.command, "USER");
        assert_eq!(msg.params, &["alice", "0", "*", "Alice Example"]);
    }

    #[test]
    fn ending_space()
    {
        let msg = Message::parse("NICK alice ").unwrap();
        assert_eq!(msg.params, &["alice"]);
    }

    #[test]
    fn ending_colon()
    {
        let msg = Message::parse("PRIVMSG #hub :").unwrap();
        assert_eq!(msg.params, &["#hub"]);
    }

    #[test]
    fn double_space()
    {
        let msg = Message::parse("PRIVMSG #hub  :hi").unwrap();
        assert_eq!(msg.params, &["#hub", "hi"]);
    }

    #[test]
    fn empty()
    {
        assert!(Message::parse("").is_none());
        assert!(Message::parse("   ").is_none());
    }

    #[test]
    fn client_prefix_is_tolerated()
    {
        let msg = Message::parse(":alice!a@example PRIVMSG #hub :hi").unwrap();
        assert_eq!(msg.prefix, Some(Prefix::user("alice", "a", "example")));
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, &["#hub", "hi"]);
    }

    #[test]
    fn formats_single_param_without_colon()
    {
        let msg = Message::with_prefix(Prefix::user("alice", "alice", "host"), "JOIN",
                                       vec!["#hub".to_string()]);
        assert_eq!(msg.to_line(), ":alice!alice@host JOIN #hub");
    }

    #[test]
    fn formats_trailing_param_with_colon()
    {
        let msg = Message::with_prefix(Prefix::user("alice", "alice", "host"), "PART",
                                       vec!["#hub".to_string(), "disconnect".to_string()]);
        assert_eq!(msg.to_line(), ":alice!alice@host PART #hub :disconnect");

        let msg = Message::new("PRIVMSG", vec!["#hub".to_string(), "hi".to_string()]);
        assert_eq!(msg.to_line(), "PRIVMSG #hub :hi");
    }

    #[test]
    fn formats_server_prefix()
    {
        let msg = Message::with_prefix(Prefix::server("127.0.0.1"), "433",
                                       vec!["*".to_string(), "alice".to_string(),
                                            "nickname is already in use".to_string()]);
        assert_eq!(msg.to_line(), ":127.0.0.1 433 * alice :nickname is already in use");
    }

    #[test]
    fn format_parse_roundtrip()
    {
        let msg = Message::with_prefix(Prefix::user("bob", "bob", "10.0.0.1"), "PRIVMSG",
                                       vec!["#hub".to_string(), "hello there".to_string()]);
        assert_eq!(Message::parse(&msg.to_line()).unwrap(), msg);
    }
}
