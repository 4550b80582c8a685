use crate::error::{Error, Result};

// command-line surface: bare flags (--foo), valued flags (--foo=value),
// the short command (-c), and the terminator (--); the first bare non-flag
// token starts the program vector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token<'a> {
    Flag(&'a str),
    Valued { name: &'a str, value: &'a str },
    ShortCommand,
    // leading '-' but none of the recognised shapes (-?, -x); the caller
    // decides whether it is a query alias or a fatal unknown option
    Other(&'a str),
}

#[derive(Debug)]
pub struct Item<'a> {
    pub index: usize,
    pub raw: &'a str,
    pub token: Token<'a>,
}

#[derive(Debug)]
pub struct Lexed<'a> {
    pub items: Vec<Item<'a>>,
    // argv index where the program vector starts
    pub program_start: Option<usize>,
}

pub fn lex(argv: &[String]) -> Result<Lexed<'_>> {
    let mut items = Vec::new();
    let mut program_start = None;

    let mut i = 1;
    while i < argv.len() {
        let raw = argv[i].as_str();

        if raw == "--" {
            if i + 1 >= argv.len() {
                return Err(Error::config("program name not found"));
            }
            program_start = Some(i + 1);
            break;
        }

        if raw == "-c" {
            if i == argv.len() - 1 {
                return Err(Error::config("option -c requires an argument"));
            }
            items.push(Item {
                index: i,
                raw,
                token: Token::ShortCommand,
            });
            i += 1;
            continue;
        }

        if let Some(body) = raw.strip_prefix("--") {
            let token = match body.split_once('=') {
                Some((name, value)) => Token::Valued { name, value },
                None => Token::Flag(body),
            };
            items.push(Item {
                index: i,
                raw,
                token,
            });
            i += 1;
            continue;
        }

        if raw.starts_with('-') {
            items.push(Item {
                index: i,
                raw,
                token: Token::Other(raw),
            });
            i += 1;
            continue;
        }

        // program name coming
        program_start = Some(i);
        break;
    }

    Ok(Lexed {
        items,
        program_start,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("burrow")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn classifies_forms() {
        let argv = args(&["--seccomp", "--caps.drop=all", "-c", "--quiet"]);
        let lexed = lex(&argv).unwrap();
        assert_eq!(lexed.items[0].token, Token::Flag("seccomp"));
        assert_eq!(
            lexed.items[1].token,
            Token::Valued {
                name: "caps.drop",
                value: "all"
            }
        );
        assert_eq!(lexed.items[2].token, Token::ShortCommand);
        assert_eq!(lexed.items[3].token, Token::Flag("quiet"));
        assert_eq!(lexed.program_start, None);
    }

    #[test]
    fn bare_token_starts_program() {
        let argv = args(&["--seccomp", "/bin/echo", "--not-an-option"]);
        let lexed = lex(&argv).unwrap();
        assert_eq!(lexed.items.len(), 1);
        assert_eq!(lexed.program_start, Some(2));
    }

    #[test]
    fn terminator_starts_program() {
        let argv = args(&["--seccomp", "--", "--weird-name"]);
        let lexed = lex(&argv).unwrap();
        assert_eq!(lexed.program_start, Some(3));
    }

    #[test]
    fn terminator_requires_program() {
        let argv = args(&["--"]);
        assert!(lex(&argv).is_err());
    }

    #[test]
    fn short_command_requires_argument() {
        let argv = args(&["-c"]);
        assert!(lex(&argv).is_err());
    }

    #[test]
    fn unrecognised_dash_is_other() {
        let argv = args(&["-?"]);
        let lexed = lex(&argv).unwrap();
        assert_eq!(lexed.items[0].token, Token::Other("-?"));
    }

    #[test]
    fn empty_value_is_kept() {
        let argv = args(&["--name="]);
        let lexed = lex(&argv).unwrap();
        assert_eq!(
            lexed.items[0].token,
            Token::Valued {
                name: "name",
                value: ""
            }
        );
    }
}
