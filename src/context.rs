use tokio::process::Command;

const DEFAULT_GPG_BINARY: &str = "gpg";

/// Options every invocation carries unless unset.
///
/// Status lines go to stderr (fd 2) and answers are read from stdin
/// (fd 0), leaving stdout for listings and exported data. The listing
/// flags fix the colon layout that [`parse_keys`](crate::parse_keys)
/// reads; change them together.
pub const DEFAULT_OPTIONS: &[(&str, Option<&str>)] = &[
    ("status-fd", Some("2")),
    ("command-fd", Some("0")),
    ("no-tty", None),
    ("quiet", None),
    ("batch", None),
    ("use-agent", None),
    ("with-colons", None),
    ("with-fingerprint", None),
    ("fixed-list-mode", None),
    (
        "list-options",
        Some(
            "show-sig-subpackets,show-uid-validity,show-unusable-uids,\
             show-unusable-subkeys,show-keyring,show-sig-expire",
        ),
    ),
];

/// Options gpg only honours when they follow the command.
pub const TRAILING_OPTIONS: &[&str] = &["keyserver"];

/// The gpg binary and the option set used to build its command lines.
///
/// Each context owns its options; changing one never affects another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    binary: String,
    options: Vec<(String, Option<String>)>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    #[must_use]
    pub fn new() -> Self {
        Self::with_binary(DEFAULT_GPG_BINARY)
    }

    #[must_use]
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            options: DEFAULT_OPTIONS
                .iter()
                .map(|(flag, value)| (flag.to_string(), value.map(str::to_string)))
                .collect(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Sets `--flag [value]`. Pass `None` for flags without a value.
    ///
    /// An option that is already set keeps its position and gets the new
    /// value.
    pub fn set_option(&mut self, flag: impl Into<String>, value: Option<impl Into<String>>) {
        let flag = flag.into();
        let value = value.map(Into::into);
        match self.options.iter_mut().find(|(f, _)| *f == flag) {
            Some((_, v)) => *v = value,
            None => self.options.push((flag, value)),
        }
    }

    /// Sets a flag that takes no value, such as `armor`.
    pub fn set_flag(&mut self, flag: impl Into<String>) {
        self.set_option(flag, None::<String>);
    }

    /// Removes an option; returns whether it was set.
    pub fn unset_option(&mut self, flag: &str) -> bool {
        let before = self.options.len();
        self.options.retain(|(f, _)| f != flag);
        self.options.len() != before
    }

    /// `Some(value)` when the option is set, where `value` is `None` for
    /// plain flags.
    pub fn option(&self, flag: &str) -> Option<Option<&str>> {
        self.options
            .iter()
            .find(|(f, _)| f == flag)
            .map(|(_, v)| v.as_deref())
    }

    pub fn options(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.options.iter().map(|(f, v)| (f.as_str(), v.as_deref()))
    }

    /// Builds the full argument vector for `verb`, binary first.
    ///
    /// The verb gets its `--` prefix if it lacks one. Options listed in
    /// [`TRAILING_OPTIONS`] are placed after the verb, before `args`.
    pub fn build<I, S>(&self, verb: &str, args: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        let (trailing, leading): (Vec<_>, Vec<_>) = self
            .options
            .iter()
            .partition(|(flag, _)| TRAILING_OPTIONS.contains(&flag.as_str()));

        let mut argv = vec![self.binary.clone()];
        push_options(&mut argv, &leading);
        if verb.starts_with("--") {
            argv.push(verb.to_string());
        } else {
            argv.push(format!("--{verb}"));
        }
        push_options(&mut argv, &trailing);
        argv.extend(args.into_iter().map(|a| a.to_string()));
        argv
    }

    /// A ready-to-spawn command for `verb`, running under the C locale so
    /// diagnostics can be matched reliably.
    pub fn command<I, S>(&self, verb: &str, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        let argv = self.build(verb, args);
        let mut cmd = Command::new(&argv[0]);
        cmd.env("LC_ALL", "C").args(&argv[1..]);
        cmd
    }
}

fn push_options(argv: &mut Vec<String>, options: &[&(String, Option<String>)]) {
    for (flag, value) in options {
        argv.push(format!("--{flag}"));
        if let Some(value) = value {
            argv.push(value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const RENDERED_DEFAULTS: &[&str] = &[
        "gpg",
        "--status-fd",
        "2",
        "--command-fd",
        "0",
        "--no-tty",
        "--quiet",
        "--batch",
        "--use-agent",
        "--with-colons",
        "--with-fingerprint",
        "--fixed-list-mode",
        "--list-options",
        "show-sig-subpackets,show-uid-validity,show-unusable-uids,show-unusable-subkeys,show-keyring,show-sig-expire",
    ];

    fn expected(tail: &[&str]) -> Vec<String> {
        RENDERED_DEFAULTS
            .iter()
            .chain(tail)
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_build_defaults() {
        let ctx = Context::new();
        assert_eq!(ctx.build("version", [] as [&str; 0]), expected(&["--version"]));
        assert_eq!(ctx.build("export", ["foo"]), expected(&["--export", "foo"]));
    }

    #[test]
    fn test_build_keeps_existing_prefix() {
        let ctx = Context::new();
        assert_eq!(
            ctx.build("--list-keys", ["7B75921E"]),
            expected(&["--list-keys", "7B75921E"])
        );
    }

    #[test]
    fn test_build_is_deterministic() {
        let mut ctx = Context::new();
        ctx.set_option("homedir", Some("/tmp/x"));
        ctx.set_flag("armor");
        let first = ctx.build("export", ["a", "b"]);
        let second = ctx.build("export", ["a", "b"]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_build_numeric_args() {
        let ctx = Context::new();
        let argv = ctx.build("list-keys", [42]);
        assert_eq!(argv.last().map(String::as_str), Some("42"));
    }

    #[test]
    fn test_trailing_options_follow_verb() {
        let mut ctx = Context::new();
        ctx.set_option("keyserver", Some("hkps://keys.example.org"));
        assert_eq!(
            ctx.build("recv-keys", ["7B75921E"]),
            expected(&[
                "--recv-keys",
                "--keyserver",
                "hkps://keys.example.org",
                "7B75921E"
            ])
        );
    }

    #[test]
    fn test_contexts_do_not_share_options() {
        let ctx = Context::new();
        let mut other = Context::new();
        other.set_option("homedir", Some("/var/nonexistent"));
        assert!(ctx.option("homedir").is_none());
        assert_eq!(other.option("homedir"), Some(Some("/var/nonexistent")));

        let mut copy = other.clone();
        copy.set_flag("armor");
        assert!(other.option("armor").is_none());
    }

    #[test]
    fn test_set_option_replaces_in_place() {
        let mut ctx = Context::new();
        ctx.set_option("status-fd", Some("1"));
        assert_eq!(ctx.option("status-fd"), Some(Some("1")));
        assert_eq!(ctx.options().next(), Some(("status-fd", Some("1"))));
        assert_eq!(ctx.options().count(), DEFAULT_OPTIONS.len());
    }

    #[test]
    fn test_unset_option() {
        let mut ctx = Context::new();
        assert!(ctx.unset_option("quiet"));
        assert!(!ctx.unset_option("quiet"));
        assert!(!ctx.build("version", [] as [&str; 0]).contains(&"--quiet".to_string()));
    }

    #[test]
    fn test_with_binary() {
        let ctx = Context::with_binary("/usr/bin/gpg2");
        assert_eq!(ctx.binary(), "/usr/bin/gpg2");
        assert_eq!(ctx.build("version", [] as [&str; 0])[0], "/usr/bin/gpg2");
    }
}
