//! Parser for `--machinereadable` output.

use std::collections::HashMap;

use vboxbuild_shared::errors::{BuildError, BuildResult};

/// Parse newline-separated `key="value"` / `key=value` pairs.
///
/// Surrounding whitespace and double quotes are stripped from keys and
/// values. Lines without exactly one `=` are ignored. Output with no
/// usable pair at all is a parse error.
pub fn parse_machine_readable(output: &str) -> BuildResult<HashMap<String, String>> {
    let mut values = HashMap::new();

    for line in output.lines() {
        let mut parts = line.split('=');
        let (Some(key), Some(value), None) = (parts.next(), parts.next(), parts.next()) else {
            continue;
        };
        let key = key.trim().trim_matches('"');
        let value = value.trim().trim_matches('"');
        values.insert(key.to_string(), value.to_string());
    }

    if values.is_empty() {
        return Err(BuildError::Parse(
            "no key=value pairs found in VM info output".to_string(),
        ));
    }
    Ok(values)
}

/// Names of all storage controllers whose type matches `controller_type`.
pub(crate) fn controllers_of_type(info: &HashMap<String, String>, controller_type: &str) -> Vec<String> {
    let mut names: Vec<(u32, String)> = info
        .iter()
        .filter(|(_, value)| value.as_str() == controller_type)
        .filter_map(|(key, _)| key.strip_prefix("storagecontrollertype"))
        .filter_map(|index| {
            let name = info.get(&format!("storagecontrollername{index}"))?;
            Some((index.parse().ok()?, name.clone()))
        })
        .collect();
    names.sort();
    names.into_iter().map(|(_, name)| name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quoted_and_unquoted_values() {
        let output = "name=\"build-vm\"\nostype=\"Ubuntu (64-bit)\"\nmemory=1024\n\"vram\"=16\n";
        let info = parse_machine_readable(output).unwrap();

        assert_eq!(info["name"], "build-vm");
        assert_eq!(info["ostype"], "Ubuntu (64-bit)");
        assert_eq!(info["memory"], "1024");
        assert_eq!(info["vram"], "16");
    }

    #[test]
    fn test_lines_without_single_equals_ignored() {
        let output = "just text\nkey=a=b\ngood = \"yes\"\r\n";
        let info = parse_machine_readable(output).unwrap();

        assert_eq!(info.len(), 1);
        assert_eq!(info["good"], "yes");
    }

    #[test]
    fn test_empty_output_is_error() {
        assert!(parse_machine_readable("").is_err());
        assert!(parse_machine_readable("no pairs here\n").is_err());
    }

    #[test]
    fn test_controllers_of_type() {
        let output = "storagecontrollername0=\"IDE Controller\"\nstoragecontrollertype0=\"PIIX4\"\n\
                      storagecontrollername1=\"Floppy Controller\"\nstoragecontrollertype1=\"I82078\"\n\
                      storagecontrollername2=\"Floppy 2\"\nstoragecontrollertype2=\"I82078\"\n";
        let info = parse_machine_readable(output).unwrap();

        assert_eq!(
            controllers_of_type(&info, "I82078"),
            vec!["Floppy Controller".to_string(), "Floppy 2".to_string()]
        );
        assert!(controllers_of_type(&info, "NVMe").is_empty());
    }
}
