use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use nix::sys::signal::Signal;

use crate::error::ConfigError;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn as_slice(&self) -> &[T] {
        match self {
            OneOrMany::One(v) => std::slice::from_ref(v),
            OneOrMany::Many(vs) => vs.as_slice(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RestartPolicy {
    Always,
    Never,
    Unexpected,
}

fn default_numprocs() -> usize { 1 }
fn default_autostart() -> bool { true }
fn default_autorestart() -> RestartPolicy { RestartPolicy::Never }
fn default_exitcodes() -> OneOrMany<i32> { OneOrMany::One(0) }
fn default_startretries() -> u32 { 3 }
fn default_starttime() -> u64 { 3 }
fn default_stopsignal() -> String { String::from("TERM") }
fn default_stoptime() -> u64 { 10 }

/// One program entry of the `programs:` map. Equality is structural over
/// every field; the reconciler restarts a program whenever any field
/// differs between the old and the newly loaded spec.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ProgramSpec {
    pub cmd: String,
    #[serde(default = "default_numprocs")]
    pub numprocs: usize,
    #[serde(default = "default_autostart")]
    pub autostart: bool,
    #[serde(default = "default_autorestart")]
    pub autorestart: RestartPolicy,
    #[serde(default = "default_exitcodes")]
    pub exitcodes: OneOrMany<i32>,
    #[serde(default = "default_startretries")]
    pub startretries: u32,
    #[serde(default = "default_starttime")]
    pub starttime: u64,
    #[serde(default = "default_stopsignal")]
    pub stopsignal: String,
    #[serde(default = "default_stoptime")]
    pub stoptime: u64,
    #[serde(default)]
    pub workingdir: Option<String>,
    #[serde(default)]
    pub umask: Option<String>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
}

impl ProgramSpec {
    pub fn accepts_exit(&self, code: i32) -> bool {
        self.exitcodes.as_slice().contains(&code)
    }

    /// Validated at load time, so a failed parse here only happens for a
    /// spec that never went through `validate`; fall back to SIGTERM.
    pub fn stop_signal(&self) -> Signal {
        parse_signal(&self.stopsignal).unwrap_or(Signal::SIGTERM)
    }

    pub fn umask_bits(&self) -> Option<u32> {
        self.umask.as_deref().and_then(parse_umask)
    }

    fn validate(&mut self, program: &str) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: String| ConfigError::Invalid {
            program: program.to_string(),
            field,
            reason,
        };

        if self.cmd.trim().is_empty() {
            return Err(invalid("cmd", "must not be empty".into()));
        }
        if !(1..=10).contains(&self.numprocs) {
            return Err(invalid(
                "numprocs",
                format!("{} is not between 1 and 10", self.numprocs),
            ));
        }
        if self.startretries == 0 {
            return Err(invalid("startretries", "must be greater than 0".into()));
        }
        if self.starttime > 60 {
            return Err(invalid(
                "starttime",
                format!("{} seconds exceeds the 60 second limit", self.starttime),
            ));
        }
        if !(1..=60).contains(&self.stoptime) {
            return Err(invalid(
                "stoptime",
                format!("{} is not between 1 and 60 seconds", self.stoptime),
            ));
        }
        for code in self.exitcodes.as_slice() {
            if !(0..=255).contains(code) {
                return Err(invalid(
                    "exitcodes",
                    format!("{code} is not a valid exit code (0-255)"),
                ));
            }
        }
        if parse_signal(&self.stopsignal).is_none() {
            return Err(invalid(
                "stopsignal",
                format!("`{}` does not name a signal", self.stopsignal),
            ));
        }
        if let Some(dir) = &self.workingdir {
            if !Path::new(dir).is_dir() {
                return Err(invalid(
                    "workingdir",
                    format!("`{dir}` is not an existing directory"),
                ));
            }
        }
        if let Some(mask) = &self.umask {
            match parse_umask(mask) {
                Some(bits) if bits <= 0o777 => {}
                _ => {
                    return Err(invalid(
                        "umask",
                        format!("`{mask}` is not an octal mask up to 0777"),
                    ));
                }
            }
        }

        normalize_output(&mut self.stdout);
        normalize_output(&mut self.stderr);
        Ok(())
    }
}

/// Accepts "TERM" as well as "SIGTERM", case-insensitive.
fn parse_signal(name: &str) -> Option<Signal> {
    let upper = name.trim().to_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&full).ok()
}

fn parse_umask(mask: &str) -> Option<u32> {
    let digits = mask.strip_prefix("0o").unwrap_or(mask);
    u32::from_str_radix(digits, 8).ok()
}

// "null"/"none" mean discard, same as leaving the field out.
fn normalize_output(target: &mut Option<String>) {
    if matches!(target.as_deref(), Some("null") | Some("none") | Some("")) {
        *target = None;
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub programs: HashMap<String, ProgramSpec>,
}

impl Config {
    /*
        @@@
        @load();
        . Reads the config file into a String. Any I/O error (file not found, permission denied, etc.) is returned as an Err.
        . Hands the raw YAML text to serde_yaml and validates every program entry before anything touches the process table.
        . An invalid entry rejects the whole file: loading is all-or-nothing.
    */
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Config::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Config, ConfigError> {
        let mut config: Config = serde_yaml::from_str(text)?;
        for (name, spec) in config.programs.iter_mut() {
            spec.validate(name)?;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(body: &str) -> Result<ProgramSpec, ConfigError> {
        let text = format!("programs:\n  demo:\n{body}");
        Config::parse(&text).map(|mut c| c.programs.remove("demo").unwrap())
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let spec = parse_one("    cmd: \"sleep 1\"\n").unwrap();
        assert_eq!(spec.numprocs, 1);
        assert!(spec.autostart);
        assert_eq!(spec.autorestart, RestartPolicy::Never);
        assert_eq!(spec.exitcodes, OneOrMany::One(0));
        assert_eq!(spec.startretries, 3);
        assert_eq!(spec.starttime, 3);
        assert_eq!(spec.stopsignal, "TERM");
        assert_eq!(spec.stoptime, 10);
        assert!(spec.workingdir.is_none());
    }

    #[test]
    fn exitcodes_accept_one_or_many() {
        let spec = parse_one("    cmd: \"true\"\n    exitcodes: 2\n").unwrap();
        assert!(spec.accepts_exit(2));
        assert!(!spec.accepts_exit(0));

        let spec = parse_one("    cmd: \"true\"\n    exitcodes: [0, 2, 143]\n").unwrap();
        assert!(spec.accepts_exit(143));
        assert!(!spec.accepts_exit(1));
    }

    #[test]
    fn numprocs_out_of_range_is_rejected() {
        let err = parse_one("    cmd: \"true\"\n    numprocs: 0\n").unwrap_err();
        assert!(err.to_string().contains("numprocs"));
        let err = parse_one("    cmd: \"true\"\n    numprocs: 11\n").unwrap_err();
        assert!(err.to_string().contains("numprocs"));
    }

    #[test]
    fn zero_startretries_is_rejected() {
        let err = parse_one("    cmd: \"true\"\n    startretries: 0\n").unwrap_err();
        assert!(err.to_string().contains("startretries"));
    }

    #[test]
    fn time_windows_are_bounded() {
        assert!(parse_one("    cmd: \"true\"\n    starttime: 0\n").is_ok());
        let err = parse_one("    cmd: \"true\"\n    starttime: 61\n").unwrap_err();
        assert!(err.to_string().contains("starttime"));
        let err = parse_one("    cmd: \"true\"\n    stoptime: 0\n").unwrap_err();
        assert!(err.to_string().contains("stoptime"));
    }

    #[test]
    fn exit_codes_must_fit_a_byte() {
        let err = parse_one("    cmd: \"true\"\n    exitcodes: [0, 256]\n").unwrap_err();
        assert!(err.to_string().contains("256"));
    }

    #[test]
    fn stopsignal_names_are_resolved() {
        let spec = parse_one("    cmd: \"true\"\n    stopsignal: SIGUSR1\n").unwrap();
        assert_eq!(spec.stop_signal(), Signal::SIGUSR1);
        let spec = parse_one("    cmd: \"true\"\n    stopsignal: int\n").unwrap();
        assert_eq!(spec.stop_signal(), Signal::SIGINT);
        let err = parse_one("    cmd: \"true\"\n    stopsignal: NOPE\n").unwrap_err();
        assert!(err.to_string().contains("NOPE"));
    }

    #[test]
    fn workingdir_must_exist() {
        assert!(parse_one("    cmd: \"true\"\n    workingdir: /tmp\n").is_ok());
        let err =
            parse_one("    cmd: \"true\"\n    workingdir: /no/such/dir/xyz\n").unwrap_err();
        assert!(err.to_string().contains("workingdir"));
    }

    #[test]
    fn umask_is_octal_and_bounded() {
        let spec = parse_one("    cmd: \"true\"\n    umask: \"022\"\n").unwrap();
        assert_eq!(spec.umask_bits(), Some(0o22));
        let spec = parse_one("    cmd: \"true\"\n    umask: \"0o77\"\n").unwrap();
        assert_eq!(spec.umask_bits(), Some(0o77));
        let err = parse_one("    cmd: \"true\"\n    umask: \"1777\"\n").unwrap_err();
        assert!(err.to_string().contains("umask"));
        let err = parse_one("    cmd: \"true\"\n    umask: \"9z\"\n").unwrap_err();
        assert!(err.to_string().contains("umask"));
    }

    #[test]
    fn null_output_targets_mean_discard() {
        let spec =
            parse_one("    cmd: \"true\"\n    stdout: \"null\"\n    stderr: none\n").unwrap();
        assert!(spec.stdout.is_none());
        assert!(spec.stderr.is_none());
        let spec = parse_one("    cmd: \"true\"\n    stdout: /tmp/out.log\n").unwrap();
        assert_eq!(spec.stdout.as_deref(), Some("/tmp/out.log"));
    }

    #[test]
    fn any_field_change_breaks_equality() {
        let a = parse_one("    cmd: \"true\"\n").unwrap();
        let mut b = a.clone();
        assert_eq!(a, b);
        b.stoptime = 11;
        assert_ne!(a, b);
        let mut c = a.clone();
        c.env = Some(HashMap::from([("K".into(), "v".into())]));
        assert_ne!(a, c);
    }

    #[test]
    fn missing_programs_section_is_an_empty_map() {
        let config = Config::parse("{}").unwrap();
        assert!(config.programs.is_empty());
    }

    #[test]
    fn invalid_yaml_is_reported() {
        assert!(matches!(
            Config::parse("programs: ["),
            Err(ConfigError::Yaml(_))
        ));
    }
}
