use std::path::PathBuf;

/// One line of terminal input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login { email: String, password: String },
    Register {
        email: String,
        password: String,
        role: String,
        name: String,
    },
    Users(Option<String>),
    Peer(String),
    Attach(PathBuf),
    Detach,
    Blog { title: String, content: String },
    Refresh,
    Logout,
    Help,
    Quit,
    /// Anything not starting with `/`.
    Send(String),
}

pub const HELP: &str = "\
/login <email> <password>                 sign in
/register <email> <password> <role> <name> create an account (accepts the terms)
/users [term]                             list or search people
/peer <username>                          open a conversation
/attach <path>                            stage a file for the next message
/detach                                   drop the staged file
/blog <title> | <content>                 publish a post, with the staged file as cover
/refresh                                  refresh the session token
/logout                                   sign out
/quit                                     leave
anything else is sent to the open conversation";

impl Command {
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Self::Send(line.to_string()));
        };

        let (name, args) = match rest.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (rest, ""),
        };

        match name {
            "login" => {
                let mut parts = args.split_whitespace();
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(email), Some(password), None) => Ok(Self::Login {
                        email: email.into(),
                        password: password.into(),
                    }),
                    _ => Err("usage: /login <email> <password>".into()),
                }
            }
            "register" => {
                let mut parts = args.splitn(4, char::is_whitespace);
                match (parts.next(), parts.next(), parts.next(), parts.next()) {
                    (Some(email), Some(password), Some(role), Some(name))
                        if !email.is_empty() && !name.trim().is_empty() =>
                    {
                        Ok(Self::Register {
                            email: email.into(),
                            password: password.into(),
                            role: role.into(),
                            name: name.trim().into(),
                        })
                    }
                    _ => Err("usage: /register <email> <password> <role> <name>".into()),
                }
            }
            "users" => Ok(Self::Users(Some(args.to_string()).filter(|a| !a.is_empty()))),
            "peer" if !args.is_empty() => Ok(Self::Peer(args.trim_start_matches('@').into())),
            "peer" => Err("usage: /peer <username>".into()),
            "attach" if !args.is_empty() => Ok(Self::Attach(PathBuf::from(args))),
            "attach" => Err("usage: /attach <path>".into()),
            "detach" => Ok(Self::Detach),
            "blog" => match args.split_once('|') {
                Some((title, content)) => Ok(Self::Blog {
                    title: title.trim().into(),
                    content: content.trim().into(),
                }),
                None => Err("usage: /blog <title> | <content>".into()),
            },
            "refresh" => Ok(Self::Refresh),
            "logout" | "signout" => Ok(Self::Logout),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" => Ok(Self::Quit),
            other => Err(format!("unknown command /{}, try /help", other)),
        }
    }
}
