//! Dockerfile parser.
//!
//! Parses Dockerfiles into a structured representation the planner and the
//! step executor work from. Supports the full standard instruction set,
//! multi-stage builds, ARG substitution points, per-instruction flags
//! (`--from`, `--chown`, `--chmod`, `--link`, `--checksum`, `--mount`,
//! `--network`, `--security`, `--platform`) and BuildKit-style heredocs on
//! RUN.
//!
//! Instructions are produced once and never mutated; each carries its
//! original source text and line number for diagnostics, image history and
//! the dry-run plan.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::ParseError;

/// A complete parsed Dockerfile.
#[derive(Debug, Clone, PartialEq)]
pub struct Dockerfile {
    pub stages: Vec<Stage>,
    /// ARGs declared before the first FROM, in declaration order.
    pub meta_args: Vec<ArgDecl>,
}

/// A single build stage: a FROM and the instructions up to the next FROM.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    /// Stage alias from `FROM ... AS name`, lowercased.
    pub name: Option<String>,
    /// The base reference exactly as written (may contain `$ARG`s).
    pub base_name: String,
    /// `FROM --platform=...` value, if any.
    pub platform: Option<String>,
    /// Instructions in this stage, excluding the FROM itself.
    pub instructions: Vec<Instruction>,
    /// Line number of the FROM.
    pub line: usize,
    /// The FROM line as written, for plan output.
    pub raw_from: String,
}

/// One ARG declaration (`ARG name` or `ARG name=default`).
#[derive(Debug, Clone, PartialEq)]
pub struct ArgDecl {
    pub name: String,
    pub value: Option<String>,
    pub line: usize,
}

/// A parsed instruction plus its source text and location.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub kind: InstructionKind,
    /// The logical source line (continuations joined) as written.
    pub raw: String,
    pub line: usize,
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Shell-form or exec-form command body.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Shell(String),
    Exec(Vec<String>),
}

/// A heredoc attached to a RUN instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Heredoc {
    pub name: String,
    pub data: String,
}

/// A `--mount=...` flag on RUN, kept as its key=value options.
#[derive(Debug, Clone, PartialEq)]
pub struct Mount {
    pub options: BTreeMap<String, String>,
}

impl Mount {
    pub fn mount_type(&self) -> &str {
        self.options.get("type").map(String::as_str).unwrap_or("bind")
    }

    pub fn target(&self) -> Option<&str> {
        self.options.get("target").or_else(|| self.options.get("dst")).map(String::as_str)
    }

    pub fn id(&self) -> Option<&str> {
        self.options.get("id").map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CopySpec {
    pub sources: Vec<String>,
    pub dest: String,
    pub from: Option<String>,
    pub chown: Option<String>,
    pub chmod: Option<String>,
    pub link: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AddSpec {
    pub sources: Vec<String>,
    pub dest: String,
    pub from: Option<String>,
    pub chown: Option<String>,
    pub chmod: Option<String>,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSpec {
    pub command: Command,
    pub mounts: Vec<Mount>,
    pub network: Option<String>,
    pub security: Option<String>,
    pub files: Vec<Heredoc>,
}

impl RunSpec {
    /// Whether the command is wrapped in the image's shell.
    pub fn prepend_shell(&self) -> bool {
        matches!(self.command, Command::Shell(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthcheckSpec {
    /// None means `HEALTHCHECK NONE`.
    pub test: Option<Command>,
    pub interval: Option<String>,
    pub timeout: Option<String>,
    pub start_period: Option<String>,
    pub retries: Option<u32>,
}

/// The closed set of instructions. New instructions require an explicit
/// arm everywhere an instruction is matched.
#[derive(Debug, Clone, PartialEq)]
pub enum InstructionKind {
    Arg { args: Vec<(String, Option<String>)> },
    Env { pairs: Vec<(String, String)> },
    Label { pairs: Vec<(String, String)> },
    Maintainer { name: String },
    User { user: String },
    Workdir { path: String },
    Expose { ports: Vec<String> },
    Volume { paths: Vec<String> },
    Cmd { command: Command },
    Entrypoint { command: Command },
    Healthcheck { health: HealthcheckSpec },
    Shell { argv: Vec<String> },
    StopSignal { signal: String },
    Onbuild { expression: String },
    Copy(CopySpec),
    Add(AddSpec),
    Run(RunSpec),
}

/// Parse a Dockerfile from its raw bytes.
pub fn parse(content: &str) -> Result<Dockerfile, ParseError> {
    Parser::new(content)?.parse()
}

/// Parse a newline-joined sequence of instructions (ONBUILD bodies).
pub fn parse_commands(lines: &[String]) -> Result<Vec<Instruction>, ParseError> {
    if lines.is_empty() {
        return Ok(Vec::new());
    }
    let mut parser = Parser::new(&lines.join("\n"))?;
    let mut out = Vec::new();
    while let Some(line) = parser.next_line() {
        out.push(parser.parse_instruction(&line)?);
    }
    Ok(out)
}

/// A logical source line: continuations joined, heredoc bodies attached.
#[derive(Debug, Clone)]
struct Line {
    num: usize,
    text: String,
    heredocs: Vec<Heredoc>,
}

struct Parser {
    lines: Vec<Line>,
    pos: usize,
}

impl Parser {
    fn new(content: &str) -> Result<Self, ParseError> {
        Ok(Self { lines: preprocess(content)?, pos: 0 })
    }

    fn next_line(&mut self) -> Option<Line> {
        let line = self.lines.get(self.pos).cloned();
        if line.is_some() {
            self.pos += 1;
        }
        line
    }

    fn peek_keyword(&self) -> Option<String> {
        self.lines.get(self.pos).map(|l| keyword_of(&l.text))
    }

    fn parse(&mut self) -> Result<Dockerfile, ParseError> {
        let mut meta_args = Vec::new();

        // ARGs before the first FROM are meta-args.
        while let Some(keyword) = self.peek_keyword() {
            if keyword == "ARG" {
                let line = self.next_line().expect("peeked");
                let inst = self.parse_instruction(&line)?;
                if let InstructionKind::Arg { args } = inst.kind {
                    for (name, value) in args {
                        meta_args.push(ArgDecl { name, value, line: line.num });
                    }
                }
            } else if keyword == "FROM" {
                break;
            } else {
                let line = self.next_line().expect("peeked");
                return Err(ParseError::new(
                    line.num,
                    format!("expected ARG or FROM before the first stage, found {keyword}"),
                ));
            }
        }

        let mut stages = Vec::new();
        while self.pos < self.lines.len() {
            stages.push(self.parse_stage()?);
        }

        if stages.is_empty() {
            return Err(ParseError::new(
                1,
                "Dockerfile must contain at least one FROM instruction",
            ));
        }

        Ok(Dockerfile { stages, meta_args })
    }

    fn parse_stage(&mut self) -> Result<Stage, ParseError> {
        let from_line = self.next_line().expect("caller checked EOF");
        let keyword = keyword_of(&from_line.text);
        if keyword != "FROM" {
            return Err(ParseError::new(
                from_line.num,
                format!("expected FROM, found {keyword}"),
            ));
        }

        let words = split_words(args_of(&from_line.text));
        let mut platform = None;
        let mut rest = &words[..];
        if let Some(first) = rest.first() {
            if let Some(value) = first.strip_prefix("--platform=") {
                platform = Some(value.to_string());
                rest = &rest[1..];
            }
        }
        let base_name = rest
            .first()
            .cloned()
            .ok_or_else(|| ParseError::new(from_line.num, "FROM requires an image reference"))?;

        let name = match rest.get(1) {
            Some(kw) if kw.eq_ignore_ascii_case("AS") => Some(
                rest.get(2)
                    .ok_or_else(|| ParseError::new(from_line.num, "FROM ... AS requires a stage name"))?
                    .to_lowercase(),
            ),
            Some(other) => {
                return Err(ParseError::new(
                    from_line.num,
                    format!("unexpected token after image reference: {other}"),
                ))
            }
            None => None,
        };

        let mut instructions = Vec::new();
        while let Some(keyword) = self.peek_keyword() {
            if keyword == "FROM" {
                break;
            }
            let line = self.next_line().expect("peeked");
            instructions.push(self.parse_instruction(&line)?);
        }

        Ok(Stage {
            name,
            base_name,
            platform,
            instructions,
            line: from_line.num,
            raw_from: from_line.text.clone(),
        })
    }

    fn parse_instruction(&mut self, line: &Line) -> Result<Instruction, ParseError> {
        let keyword = keyword_of(&line.text);
        let args = args_of(&line.text);
        let kind = match keyword.as_str() {
            "RUN" => self.parse_run(line, args)?,
            "COPY" => self.parse_copy(line.num, args)?,
            "ADD" => self.parse_add(line.num, args)?,
            "ENV" => self.parse_env(line.num, args)?,
            "ARG" => self.parse_arg(line.num, args)?,
            "LABEL" => InstructionKind::Label { pairs: parse_pairs(args) },
            "MAINTAINER" => InstructionKind::Maintainer { name: args.trim().to_string() },
            "EXPOSE" => InstructionKind::Expose { ports: split_words(args) },
            "WORKDIR" => {
                let path = split_words(args).into_iter().next().ok_or_else(|| {
                    ParseError::new(line.num, "WORKDIR requires a path")
                })?;
                InstructionKind::Workdir { path }
            }
            "USER" => {
                let user = args.trim();
                if user.is_empty() {
                    return Err(ParseError::new(line.num, "USER requires a user"));
                }
                InstructionKind::User { user: user.to_string() }
            }
            "VOLUME" => InstructionKind::Volume { paths: parse_string_list(line.num, args)? },
            "CMD" => InstructionKind::Cmd { command: parse_command(args) },
            "ENTRYPOINT" => InstructionKind::Entrypoint { command: parse_command(args) },
            "HEALTHCHECK" => self.parse_healthcheck(line.num, args)?,
            "SHELL" => {
                let argv = serde_json::from_str::<Vec<String>>(args.trim()).map_err(|_| {
                    ParseError::new(line.num, "SHELL requires JSON array form")
                })?;
                InstructionKind::Shell { argv }
            }
            "STOPSIGNAL" => {
                let signal = args.trim();
                if signal.is_empty() {
                    return Err(ParseError::new(line.num, "STOPSIGNAL requires a signal"));
                }
                InstructionKind::StopSignal { signal: signal.to_string() }
            }
            "ONBUILD" => self.parse_onbuild(line.num, args)?,
            other => {
                return Err(ParseError::new(line.num, format!("unknown instruction: {other}")))
            }
        };

        Ok(Instruction { kind, raw: line.text.clone(), line: line.num })
    }

    fn parse_run(&mut self, line: &Line, args: &str) -> Result<InstructionKind, ParseError> {
        let mut mounts = Vec::new();
        let mut network = None;
        let mut security = None;

        let mut rest = args.trim_start();
        loop {
            if let Some(tail) = rest.strip_prefix("--mount=") {
                let (value, remaining) = take_word(tail);
                mounts.push(parse_mount(line.num, value)?);
                rest = remaining.trim_start();
            } else if let Some(tail) = rest.strip_prefix("--network=") {
                let (value, remaining) = take_word(tail);
                network = Some(value.to_string());
                rest = remaining.trim_start();
            } else if let Some(tail) = rest.strip_prefix("--security=") {
                let (value, remaining) = take_word(tail);
                security = Some(value.to_string());
                rest = remaining.trim_start();
            } else {
                break;
            }
        }

        if rest.is_empty() && line.heredocs.is_empty() {
            return Err(ParseError::new(line.num, "RUN requires a command"));
        }

        Ok(InstructionKind::Run(RunSpec {
            command: parse_command(rest),
            mounts,
            network,
            security,
            files: line.heredocs.clone(),
        }))
    }

    fn parse_copy(&mut self, line: usize, args: &str) -> Result<InstructionKind, ParseError> {
        let words = split_words(args);
        let mut from = None;
        let mut chown = None;
        let mut chmod = None;
        let mut link = false;
        let mut paths = Vec::new();

        for word in words {
            if let Some(v) = word.strip_prefix("--from=") {
                from = Some(v.to_string());
            } else if let Some(v) = word.strip_prefix("--chown=") {
                chown = Some(v.to_string());
            } else if let Some(v) = word.strip_prefix("--chmod=") {
                chmod = Some(v.to_string());
            } else if word == "--link" || word == "--link=true" {
                link = true;
            } else if word.starts_with("--") {
                return Err(ParseError::new(line, format!("unknown COPY flag: {word}")));
            } else {
                paths.push(word);
            }
        }

        if paths.len() < 2 {
            return Err(ParseError::new(line, "COPY requires at least one source and a destination"));
        }
        let dest = paths.pop().expect("len checked");
        Ok(InstructionKind::Copy(CopySpec { sources: paths, dest, from, chown, chmod, link }))
    }

    fn parse_add(&mut self, line: usize, args: &str) -> Result<InstructionKind, ParseError> {
        let words = split_words(args);
        let mut from = None;
        let mut chown = None;
        let mut chmod = None;
        let mut checksum = None;
        let mut paths = Vec::new();

        for word in words {
            if let Some(v) = word.strip_prefix("--from=") {
                from = Some(v.to_string());
            } else if let Some(v) = word.strip_prefix("--chown=") {
                chown = Some(v.to_string());
            } else if let Some(v) = word.strip_prefix("--chmod=") {
                chmod = Some(v.to_string());
            } else if let Some(v) = word.strip_prefix("--checksum=") {
                checksum = Some(v.to_string());
            } else if word == "--link" || word == "--link=true" {
                // --link changes layer reuse in BuildKit; strata always
                // snapshots per step, so it is accepted and ignored.
            } else if word.starts_with("--") {
                return Err(ParseError::new(line, format!("unknown ADD flag: {word}")));
            } else {
                paths.push(word);
            }
        }

        if paths.len() < 2 {
            return Err(ParseError::new(line, "ADD requires at least one source and a destination"));
        }
        let dest = paths.pop().expect("len checked");
        Ok(InstructionKind::Add(AddSpec { sources: paths, dest, from, chown, chmod, checksum }))
    }

    fn parse_env(&mut self, line: usize, args: &str) -> Result<InstructionKind, ParseError> {
        let words = split_words(args);
        if words.is_empty() {
            return Err(ParseError::new(line, "ENV requires at least one key"));
        }
        // `ENV key=value [key=value...]` or legacy `ENV key value...`.
        let pairs = if words[0].contains('=') {
            words
                .iter()
                .filter_map(|w| w.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
                .collect()
        } else {
            if words.len() < 2 {
                return Err(ParseError::new(line, "ENV requires a value"));
            }
            vec![(words[0].clone(), words[1..].join(" "))]
        };
        Ok(InstructionKind::Env { pairs })
    }

    fn parse_arg(&mut self, line: usize, args: &str) -> Result<InstructionKind, ParseError> {
        let words = split_words(args);
        if words.is_empty() {
            return Err(ParseError::new(line, "ARG requires a name"));
        }
        let args = words
            .into_iter()
            .map(|w| match w.split_once('=') {
                Some((name, value)) => (name.to_string(), Some(value.to_string())),
                None => (w, None),
            })
            .collect();
        Ok(InstructionKind::Arg { args })
    }

    fn parse_healthcheck(&mut self, line: usize, args: &str) -> Result<InstructionKind, ParseError> {
        let trimmed = args.trim();
        if trimmed.eq_ignore_ascii_case("NONE") {
            return Ok(InstructionKind::Healthcheck {
                health: HealthcheckSpec {
                    test: None,
                    interval: None,
                    timeout: None,
                    start_period: None,
                    retries: None,
                },
            });
        }

        let mut interval = None;
        let mut timeout = None;
        let mut start_period = None;
        let mut retries = None;
        let mut rest = trimmed;

        loop {
            if let Some(tail) = rest.strip_prefix("--interval=") {
                let (value, remaining) = take_word(tail);
                interval = Some(value.to_string());
                rest = remaining.trim_start();
            } else if let Some(tail) = rest.strip_prefix("--timeout=") {
                let (value, remaining) = take_word(tail);
                timeout = Some(value.to_string());
                rest = remaining.trim_start();
            } else if let Some(tail) = rest.strip_prefix("--start-period=") {
                let (value, remaining) = take_word(tail);
                start_period = Some(value.to_string());
                rest = remaining.trim_start();
            } else if let Some(tail) = rest.strip_prefix("--retries=") {
                let (value, remaining) = take_word(tail);
                retries = Some(value.parse().map_err(|_| {
                    ParseError::new(line, format!("invalid retries value: {value}"))
                })?);
                rest = remaining.trim_start();
            } else {
                break;
            }
        }

        let cmd = rest.strip_prefix("CMD").map(str::trim_start).ok_or_else(|| {
            ParseError::new(line, "HEALTHCHECK requires CMD or NONE")
        })?;

        Ok(InstructionKind::Healthcheck {
            health: HealthcheckSpec {
                test: Some(parse_command(cmd)),
                interval,
                timeout,
                start_period,
                retries,
            },
        })
    }

    fn parse_onbuild(&mut self, line: usize, args: &str) -> Result<InstructionKind, ParseError> {
        let expression = args.trim().to_string();
        let inner = keyword_of(&expression);
        if matches!(inner.as_str(), "FROM" | "MAINTAINER" | "ONBUILD") {
            return Err(ParseError::new(line, format!("{inner} is not allowed in ONBUILD")));
        }
        // Validate now so a bad trigger fails the declaring build, not the
        // downstream one.
        parse_commands(&[expression.clone()])
            .map_err(|e| ParseError::new(line, format!("invalid ONBUILD expression: {e}")))?;
        Ok(InstructionKind::Onbuild { expression })
    }
}

/// Join continuation lines, strip comments, and capture heredoc bodies.
fn preprocess(content: &str) -> Result<Vec<Line>, ParseError> {
    let raw: Vec<&str> = content.lines().collect();
    let mut out = Vec::new();
    let mut i = 0;

    while i < raw.len() {
        let start = i;
        let trimmed = raw[i].trim();
        i += 1;

        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let mut text = trimmed.to_string();
        // Continuations: a trailing backslash joins the next line; comment
        // lines inside a continuation are dropped.
        while text.ends_with('\\') && i < raw.len() {
            text.pop();
            let next = raw[i].trim();
            i += 1;
            if next.starts_with('#') {
                // Re-check the same continuation state with the next line.
                text.push('\\');
                continue;
            }
            if !text.is_empty() && !text.ends_with(' ') && !next.is_empty() {
                text.push(' ');
            }
            text.push_str(next);
        }

        // Heredocs: consume body lines for each `<<MARK` token.
        let mut heredocs = Vec::new();
        for name in heredoc_markers(&text) {
            let mut data = String::new();
            let mut terminated = false;
            while i < raw.len() {
                let body_line = raw[i];
                i += 1;
                if body_line.trim_end() == name {
                    terminated = true;
                    break;
                }
                data.push_str(body_line);
                data.push('\n');
            }
            if !terminated {
                return Err(ParseError::new(
                    start + 1,
                    format!("unterminated heredoc: expected {name}"),
                ));
            }
            heredocs.push(Heredoc { name, data });
        }

        out.push(Line { num: start + 1, text, heredocs });
    }

    Ok(out)
}

/// Heredoc markers (`<<EOF`, `<<-EOF`, `<<"EOF"`) in order of appearance.
fn heredoc_markers(text: &str) -> Vec<String> {
    let mut names = Vec::new();
    for word in text.split_whitespace() {
        if let Some(rest) = word.strip_prefix("<<") {
            let rest = rest.strip_prefix('-').unwrap_or(rest);
            let rest = rest.trim_matches(|c| c == '"' || c == '\'');
            if !rest.is_empty()
                && rest.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                && rest.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            {
                names.push(rest.to_string());
            }
        }
    }
    names
}

fn keyword_of(line: &str) -> String {
    line.split_whitespace().next().unwrap_or("").to_uppercase()
}

fn args_of(line: &str) -> &str {
    match line.find(char::is_whitespace) {
        Some(idx) => line[idx..].trim_start(),
        None => "",
    }
}

/// Split one whitespace-delimited word off the front.
fn take_word(s: &str) -> (&str, &str) {
    match s.find(char::is_whitespace) {
        Some(idx) => (&s[..idx], &s[idx..]),
        None => (s, ""),
    }
}

/// Exec form if the body is a JSON array, shell form otherwise.
fn parse_command(args: &str) -> Command {
    let trimmed = args.trim();
    if trimmed.starts_with('[') {
        if let Ok(argv) = serde_json::from_str::<Vec<String>>(trimmed) {
            return Command::Exec(argv);
        }
    }
    Command::Shell(trimmed.to_string())
}

/// `VOLUME ["/a", "/b"]` or `VOLUME /a /b`.
fn parse_string_list(line: usize, args: &str) -> Result<Vec<String>, ParseError> {
    let trimmed = args.trim();
    if trimmed.starts_with('[') {
        serde_json::from_str::<Vec<String>>(trimmed)
            .map_err(|_| ParseError::new(line, "invalid JSON array"))
    } else {
        let words = split_words(trimmed);
        if words.is_empty() {
            return Err(ParseError::new(line, "expected at least one path"));
        }
        Ok(words)
    }
}

/// key=value pairs with optional quotes around the value.
fn parse_pairs(args: &str) -> Vec<(String, String)> {
    split_words(args)
        .iter()
        .filter_map(|w| {
            w.split_once('=').map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect()
}

fn parse_mount(line: usize, value: &str) -> Result<Mount, ParseError> {
    let mut options = BTreeMap::new();
    for part in value.split(',').filter(|p| !p.is_empty()) {
        match part.split_once('=') {
            Some((k, v)) => options.insert(k.to_string(), v.to_string()),
            // Bare keys like `readonly`.
            None => options.insert(part.to_string(), "true".to_string()),
        };
    }
    if options.is_empty() {
        return Err(ParseError::new(line, "empty --mount flag"));
    }
    Ok(Mount { options })
}

/// Whitespace word splitting that respects single and double quotes.
/// Quotes are stripped; a backslash escapes the next character outside
/// single quotes.
pub fn split_words(s: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_word = true;
                while let Some(c) = chars.next() {
                    match c {
                        '"' => break,
                        '\\' => {
                            if let Some(next) = chars.next() {
                                current.push(next);
                            }
                        }
                        _ => current.push(c),
                    }
                }
            }
            '\'' => {
                in_word = true;
                for c in chars.by_ref() {
                    if c == '\'' {
                        break;
                    }
                    current.push(c);
                }
            }
            '\\' => {
                in_word = true;
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            _ => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}
