use std::collections::HashMap;
use std::fs;

use crate::Result;

lazy_static! {
    static ref CMDLINE: CommandLine = match CommandLine::load() {
        Ok(cl) => cl,
        Err(err) => {
            warn!("Failed to load kernel command line: {}", crate::format_error(&err));
            CommandLine::new()
        }
    };
}

/// Kernel command line parsed from /proc/cmdline into a map of key/value
/// pairs. The value is optional since flag variables carry none.
///
/// Lazily constructed singleton.
#[derive(Clone)]
pub struct CommandLine {
    varmap: HashMap<String, Option<String>>,
}

impl CommandLine {
    pub fn var_exists(name: &str) -> bool {
        CMDLINE._var_exists(name)
    }

    pub fn get_value(name: &str) -> Option<&'static str> {
        CMDLINE._get_value(name)
    }

    /// `rootprep.verbose` enables progress output.
    pub fn verbose() -> bool {
        Self::var_exists("rootprep.verbose")
    }

    pub fn debug() -> bool {
        Self::var_exists("rootprep.debug")
    }

    /// `rootprep.device=/dev/...` overrides the configured rootfs device.
    pub fn device() -> Option<&'static str> {
        Self::get_value("rootprep.device")
    }

    fn new() -> Self {
        CommandLine { varmap: HashMap::new() }
    }

    fn load() -> Result<Self> {
        let content = fs::read_to_string("/proc/cmdline")?;
        Ok(CommandLine { varmap: parse_vars(&content) })
    }

    fn _var_exists(&self, name: &str) -> bool {
        self.varmap.contains_key(name)
    }

    fn _get_value(&self, name: &str) -> Option<&str> {
        match self.varmap.get(name) {
            Some(&Some(ref value)) => Some(value.as_str()),
            _ => None,
        }
    }
}

fn parse_vars(cmdline: &str) -> HashMap<String, Option<String>> {
    let mut varmap = HashMap::new();
    for word in cmdline.split_whitespace() {
        // A '--' marker ends kernel arguments; everything after it belongs
        // to init.
        if word == "--" {
            break;
        }
        match word.find('=') {
            Some(idx) => {
                varmap.insert(word[..idx].to_string(), Some(word[idx + 1..].to_string()));
            }
            None => {
                varmap.insert(word.to_string(), None);
            }
        }
    }
    varmap
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_and_values_parse() {
        let vars = parse_vars("quiet root=/dev/sda2 rootprep.verbose rootprep.device=/dev/vda3");
        assert!(vars.contains_key("quiet"));
        assert_eq!(vars.get("quiet"), Some(&None));
        assert_eq!(vars.get("root"), Some(&Some("/dev/sda2".to_string())));
        assert_eq!(vars.get("rootprep.device"), Some(&Some("/dev/vda3".to_string())));
    }

    #[test]
    fn init_arguments_are_ignored() {
        let vars = parse_vars("root=/dev/sda2 -- init.arg=1");
        assert!(vars.contains_key("root"));
        assert!(!vars.contains_key("init.arg"));
    }
}
