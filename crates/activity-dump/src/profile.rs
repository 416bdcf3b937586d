//! Generation of security profiles from persisted activity dumps.

use std::{
    collections::{HashMap, HashSet},
    fs::{self, Permissions},
    io::{self, Write},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    dump::Selector,
    tree::{ActivityDumpDocument, ProcessNodeDocument},
};

const PROFILE_TEMPLATE: &str = include_str!("./profile.yaml.leon");
const RULE_TEMPLATE: &str = include_str!("./rule.yaml.leon");

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("couldn't open activity dump file {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("couldn't parse activity dump file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("activity dump has no valid selector")]
    NoSelector,
    #[error("couldn't create profile file in {dir}")]
    Create {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("couldn't change the mode of the profile file {path}")]
    Permissions {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("couldn't generate profile: {0}")]
    Template(String),
    #[error("couldn't write profile")]
    Write(#[source] io::Error),
    #[error("couldn't keep profile file")]
    Persist(#[source] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileRule {
    pub id: String,
    pub expression: String,
}

/// Declarative security profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub selector: Vec<String>,
    pub rules: Vec<ProfileRule>,
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Expressions describing the behavior of a single process.
fn process_expressions(node: &ProcessNodeDocument) -> Vec<String> {
    let process = if node.filename.is_empty() {
        format!("process.comm == {}", quote(&node.comm))
    } else {
        format!("process.file.path == {}", quote(&node.filename))
    };

    let mut expressions = Vec::new();
    if !node.filename.is_empty() {
        expressions.push(format!("exec.file.path == {}", quote(&node.filename)));
    }
    expressions.extend(
        node.files
            .iter()
            .map(|file| format!("open.file.path == {} && {process}", quote(file))),
    );
    expressions.extend(
        node.dns
            .iter()
            .map(|name| format!("dns.question.name == {} && {process}", quote(name))),
    );
    expressions.extend(
        node.binds
            .iter()
            .map(|address| format!("bind.addr == {} && {process}", quote(address))),
    );
    expressions
}

impl Profile {
    pub fn from_dump(document: &ActivityDumpDocument) -> Result<Self, ProfileError> {
        let (name, selector) = match document.selector().ok_or(ProfileError::NoSelector)? {
            Selector::Comm(comm) => (
                format!("profile_{}", sanitize(&comm)),
                format!("process.comm == {}", quote(&comm)),
            ),
            Selector::ContainerId(id) => (
                format!("profile_{}", sanitize(&id)),
                format!("container.id == {}", quote(&id)),
            ),
        };

        let mut seen = HashSet::new();
        let mut expressions = Vec::new();
        for root in &document.processes {
            root.visit(&mut |node| {
                for expression in process_expressions(node) {
                    if seen.insert(expression.clone()) {
                        expressions.push(expression);
                    }
                }
            });
        }

        let rules = expressions
            .into_iter()
            .enumerate()
            .map(|(i, expression)| ProfileRule {
                id: format!("{name}_rule_{i}"),
                expression,
            })
            .collect();

        Ok(Self {
            name,
            selector: vec![selector],
            rules,
        })
    }
}

/// Renders `value` as a double quoted YAML scalar, escaping everything
/// YAML doesn't accept verbatim.
fn yaml_scalar(value: &str) -> String {
    let mut scalar = String::with_capacity(value.len() + 2);
    scalar.push('"');
    for c in value.chars() {
        match c {
            '"' => scalar.push_str("\\\""),
            '\\' => scalar.push_str("\\\\"),
            '\n' => scalar.push_str("\\n"),
            '\t' => scalar.push_str("\\t"),
            '\r' => scalar.push_str("\\r"),
            c if c.is_control()
                || matches!(c, '\u{2028}' | '\u{2029}' | '\u{feff}' | '\u{fffe}' | '\u{ffff}') =>
            {
                scalar.push_str(&format!("\\u{:04x}", u32::from(c)));
            }
            c => scalar.push(c),
        }
    }
    scalar.push('"');
    scalar
}

pub struct ProfileTemplate {
    profile: leon::Template<'static>,
    rule: leon::Template<'static>,
}

impl ProfileTemplate {
    pub fn new() -> Result<Self, ProfileError> {
        let parse = |template: &'static str| {
            leon::Template::parse(template).map_err(|err| ProfileError::Template(err.to_string()))
        };
        Ok(Self {
            profile: parse(PROFILE_TEMPLATE)?,
            rule: parse(RULE_TEMPLATE)?,
        })
    }

    pub fn render(&self, profile: &Profile) -> Result<String, ProfileError> {
        let rules = profile
            .rules
            .iter()
            .map(|rule| {
                let mut values = HashMap::new();
                values.insert("id", yaml_scalar(&rule.id));
                values.insert("expression", yaml_scalar(&rule.expression));
                self.rule
                    .render(&values)
                    .map_err(|err| ProfileError::Template(err.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut values = HashMap::new();
        values.insert("name", yaml_scalar(&profile.name));
        values.insert(
            "selector",
            yaml_scalar(profile.selector.first().map_or("", String::as_str)),
        );
        values.insert(
            "rules",
            if rules.is_empty() {
                " []".to_string()
            } else {
                format!("\n{}", rules.join("\n"))
            },
        );
        self.profile
            .render(&values)
            .map_err(|err| ProfileError::Template(err.to_string()))
    }
}

/// Derives a profile from the activity dump persisted at `dump_file` and
/// writes it, readable only by its owner, to a new file inside `output_dir`.
pub fn generate_profile(dump_file: &Path, output_dir: &Path) -> Result<PathBuf, ProfileError> {
    let data = fs::read_to_string(dump_file).map_err(|source| ProfileError::Open {
        path: dump_file.to_path_buf(),
        source,
    })?;
    let document: ActivityDumpDocument =
        serde_json::from_str(&data).map_err(|source| ProfileError::Parse {
            path: dump_file.to_path_buf(),
            source,
        })?;
    let profile = Profile::from_dump(&document)?;
    let content = ProfileTemplate::new()?.render(&profile)?;

    let mut file = tempfile::Builder::new()
        .prefix("profile-")
        .suffix(".yaml")
        .tempfile_in(output_dir)
        .map_err(|source| ProfileError::Create {
            dir: output_dir.to_path_buf(),
            source,
        })?;
    file.write_all(content.as_bytes())
        .and_then(|()| file.flush())
        .map_err(ProfileError::Write)?;
    fs::set_permissions(file.path(), Permissions::from_mode(0o400)).map_err(|source| {
        ProfileError::Permissions {
            path: file.path().to_path_buf(),
            source,
        }
    })?;
    let (_, path) = file.keep().map_err(|err| ProfileError::Persist(err.error))?;

    log::info!(
        "profile {} with {} rules written to {}",
        profile.name,
        profile.rules.len(),
        path.display()
    );
    Ok(path)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::tree::NodeGeneration;

    fn document(processes: Vec<ProcessNodeDocument>) -> ActivityDumpDocument {
        ActivityDumpDocument {
            comm: Some("nginx".to_string()),
            container_id: None,
            start: Utc::now(),
            end: None,
            timeout_secs: 60,
            differentiate_args: false,
            with_graph: false,
            tags: Vec::new(),
            processes,
        }
    }

    fn node(filename: &str, files: &[&str], children: Vec<ProcessNodeDocument>) -> ProcessNodeDocument {
        ProcessNodeDocument {
            pid: 1,
            ppid: 0,
            comm: "nginx".to_string(),
            filename: filename.to_string(),
            argv: Vec::new(),
            generation: NodeGeneration::Runtime,
            files: files.iter().map(|f| f.to_string()).collect(),
            dns: Vec::new(),
            binds: Vec::new(),
            children,
        }
    }

    #[test]
    fn template_parse() {
        assert!(ProfileTemplate::new().is_ok())
    }

    #[test]
    fn rules_are_deduplicated_in_tree_order() {
        let worker = node("/usr/sbin/nginx", &["/var/log/nginx/access.log"], Vec::new());
        let master = node("/usr/sbin/nginx", &["/etc/nginx/nginx.conf"], vec![worker]);
        let profile = Profile::from_dump(&document(vec![master])).unwrap();

        assert_eq!(profile.name, "profile_nginx");
        assert_eq!(profile.selector, vec![r#"process.comm == "nginx""#.to_string()]);
        let expressions: Vec<&str> = profile
            .rules
            .iter()
            .map(|rule| rule.expression.as_str())
            .collect();
        assert_eq!(
            expressions,
            [
                r#"exec.file.path == "/usr/sbin/nginx""#,
                r#"open.file.path == "/etc/nginx/nginx.conf" && process.file.path == "/usr/sbin/nginx""#,
                r#"open.file.path == "/var/log/nginx/access.log" && process.file.path == "/usr/sbin/nginx""#,
            ]
        );
        assert_eq!(profile.rules[2].id, "profile_nginx_rule_2");
    }

    #[test]
    fn rendered_profile_is_valid_yaml() {
        let profile = Profile {
            name: "it's".to_string(),
            selector: vec!["process.comm == \"a: b\"".to_string()],
            rules: vec![ProfileRule {
                id: "r0".to_string(),
                expression: "open.file.path == \"/tmp/#x\"".to_string(),
            }],
        };
        let rendered = ProfileTemplate::new().unwrap().render(&profile).unwrap();
        let parsed: Profile = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(parsed, profile);

        let empty = Profile {
            rules: Vec::new(),
            ..profile
        };
        let rendered = ProfileTemplate::new().unwrap().render(&empty).unwrap();
        let parsed: Profile = serde_yaml::from_str(&rendered).unwrap();
        assert!(parsed.rules.is_empty());
    }

    #[test]
    fn control_characters_are_escaped() {
        let path = "/tmp/a\nb\tc\"d\\e\u{7f}f\u{85}g\u{2028}h\u{1b}[0m";
        let profile = Profile {
            name: "profile_sh".to_string(),
            selector: vec![r#"process.comm == "sh""#.to_string()],
            rules: vec![ProfileRule {
                id: "profile_sh_rule_0".to_string(),
                expression: format!("open.file.path == {}", quote(path)),
            }],
        };
        let rendered = ProfileTemplate::new().unwrap().render(&profile).unwrap();
        assert!(rendered.contains(r#"name: "profile_sh""#));
        assert!(!rendered.contains('\t'));
        assert!(!rendered.contains('\u{7f}'));
        assert_eq!(rendered.lines().count(), 8);

        let parsed: Profile = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(parsed, profile);
    }

    #[test]
    fn missing_dump_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            generate_profile(&dir.path().join("missing.json"), dir.path()),
            Err(ProfileError::Open { .. })
        ));

        let broken = dir.path().join("broken.json");
        fs::write(&broken, "{").unwrap();
        assert!(matches!(
            generate_profile(&broken, dir.path()),
            Err(ProfileError::Parse { .. })
        ));
    }
}
