//! Structured construction of remote command lines.
//!
//! Every argument handed to a [`ShellCommand`] is treated as an opaque token
//! and quoted for POSIX `sh` when rendered, so parameter values containing
//! spaces, quotes or metacharacters can never change the shape of the command
//! line. Arguments added with [`ShellCommand::secret`] are rendered verbatim
//! for execution but masked in the [`std::fmt::Display`] form, which is the
//! only form that is ever logged or recorded in a job trace.

use std::borrow::Cow;
use std::fmt;

const MASK: &str = "'********'";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Plain(String),
    Secret(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Reveal,
    Mask,
}

impl Token {
    fn render(&self, mode: Mode) -> Cow<'_, str> {
        match (self, mode) {
            (Token::Plain(value), _) | (Token::Secret(value), Mode::Reveal) => {
                shell_words::quote(value)
            }
            (Token::Secret(_), Mode::Mask) => Cow::Borrowed(MASK),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Redirect {
    Stdout(Token),
    Quiet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    And,
    Or,
    Then,
}

impl Op {
    fn as_str(&self) -> &'static str {
        match self {
            Op::And => " && ",
            Op::Or => " || ",
            Op::Then => "; ",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Simple {
        program: String,
        args: Vec<Token>,
        redirects: Vec<Redirect>,
    },
    Chain {
        left: Box<Node>,
        op: Op,
        right: Box<Node>,
    },
    AsUser {
        user: String,
        inner: Box<Node>,
    },
}

impl Node {
    fn render(&self, mode: Mode) -> String {
        match self {
            Node::Simple {
                program,
                args,
                redirects,
            } => {
                let mut out = shell_words::quote(program).into_owned();
                for arg in args {
                    out.push(' ');
                    out.push_str(&arg.render(mode));
                }
                for redirect in redirects {
                    match redirect {
                        Redirect::Stdout(path) => {
                            out.push_str(" > ");
                            out.push_str(&path.render(mode));
                        }
                        Redirect::Quiet => out.push_str(" >/dev/null 2>&1"),
                    }
                }
                out
            }
            Node::Chain { left, op, right } => {
                // `&&` and `||` share precedence and associate left, so only a
                // `;` chain on the left needs braces.
                let left = match left.as_ref() {
                    chain @ Node::Chain { op: Op::Then, .. } if *op != Op::Then => {
                        group(chain.render(mode))
                    }
                    other => other.render(mode),
                };
                let right = match right.as_ref() {
                    chain @ Node::Chain { .. } => group(chain.render(mode)),
                    other => other.render(mode),
                };
                format!("{left}{}{right}", op.as_str())
            }
            Node::AsUser { user, inner } => {
                let inner = inner.render(mode);
                format!(
                    "su - {} -c {}",
                    shell_words::quote(user),
                    shell_words::quote(&inner)
                )
            }
        }
    }
}

fn group(rendered: String) -> String {
    format!("{{ {rendered}; }}")
}

/// A remote command line built from quoted tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    node: Node,
}

impl ShellCommand {
    /// Start a simple command running `program`.
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            node: Node::Simple {
                program: program.into(),
                args: vec![],
                redirects: vec![],
            },
        }
    }

    /// Run a constant `sh -c` body with positional arguments. `$0` is set to
    /// `name`, and `args` are available as `$1..$n`. This is the only way to
    /// use shell control flow without interpolating caller input into it.
    pub fn script<S: Into<String>>(body: &'static str, name: &str, args: Vec<S>) -> Self {
        let mut cmd = Self::new("sh").arg("-c").arg(body).arg(name);
        for arg in args {
            cmd = cmd.arg(arg);
        }
        cmd
    }

    /// Hand an operator-supplied command line to `sh -c` as a single token.
    pub fn shell<S: Into<String>>(line: S) -> Self {
        Self::new("sh").arg("-c").arg(line)
    }

    /// Write `content` followed by a newline to `path`, truncating it.
    pub fn write_file<P: Into<String>, C: Into<String>>(path: P, content: C) -> Self {
        Self::new("printf")
            .arg("%s\\n")
            .arg(content)
            .stdout_to(path)
    }

    /// Same as [`ShellCommand::write_file`], but the content is masked in the
    /// displayed form.
    pub fn write_secret_file<P: Into<String>, C: Into<String>>(path: P, content: C) -> Self {
        Self::new("printf")
            .arg("%s\\n")
            .secret(content)
            .stdout_to(path)
    }

    /// Append a plain argument. Has no effect on composed commands.
    pub fn arg<S: Into<String>>(self, arg: S) -> Self {
        self.push_token(Token::Plain(arg.into()))
    }

    pub fn args<I, S>(self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        args.into_iter().fold(self, |cmd, arg| cmd.arg(arg))
    }

    /// Append an argument whose value must never be logged.
    pub fn secret<S: Into<String>>(self, arg: S) -> Self {
        self.push_token(Token::Secret(arg.into()))
    }

    /// Redirect stdout to `path`, truncating it.
    pub fn stdout_to<S: Into<String>>(self, path: S) -> Self {
        self.push_redirect(Redirect::Stdout(Token::Plain(path.into())))
    }

    /// Discard stdout and stderr.
    pub fn quiet(self) -> Self {
        self.push_redirect(Redirect::Quiet)
    }

    /// `self && next`
    pub fn and(self, next: ShellCommand) -> Self {
        self.chain(Op::And, next)
    }

    /// `self || next`
    pub fn or(self, next: ShellCommand) -> Self {
        self.chain(Op::Or, next)
    }

    /// `self; next`
    pub fn then(self, next: ShellCommand) -> Self {
        self.chain(Op::Then, next)
    }

    /// Run this command through `su - user -c`.
    pub fn as_user<S: Into<String>>(self, user: S) -> Self {
        Self {
            node: Node::AsUser {
                user: user.into(),
                inner: Box::new(self.node),
            },
        }
    }

    /// The text sent to the remote shell. Contains secrets; never log it.
    pub fn render(&self) -> String {
        self.node.render(Mode::Reveal)
    }

    /// Whether any token of this command is a secret.
    pub fn has_secrets(&self) -> bool {
        fn walk(node: &Node) -> bool {
            match node {
                Node::Simple { args, .. } => args.iter().any(|t| matches!(t, Token::Secret(_))),
                Node::Chain { left, right, .. } => walk(left) || walk(right),
                Node::AsUser { inner, .. } => walk(inner),
            }
        }
        walk(&self.node)
    }

    fn chain(self, op: Op, next: ShellCommand) -> Self {
        Self {
            node: Node::Chain {
                left: Box::new(self.node),
                op,
                right: Box::new(next.node),
            },
        }
    }

    fn push_token(mut self, token: Token) -> Self {
        if let Node::Simple { ref mut args, .. } = self.node {
            args.push(token);
        }
        self
    }

    fn push_redirect(mut self, redirect: Redirect) -> Self {
        if let Node::Simple {
            ref mut redirects, ..
        } = self.node
        {
            redirects.push(redirect);
        }
        self
    }
}

impl fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.node.render(Mode::Mask))
    }
}
