//! Command classification rules.
//!
//! Lists are plain data so deployments can tighten them; [`ApprovalPolicy::validate`]
//! rejects lists that contradict each other.

use agent_core::ApprovalCategory;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ApprovalError;
use crate::builtin::render_kubectl_args;

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

/// Substrings removed before looking for output redirection.
const HARMLESS_REDIRECTS: &[&str] = &["2>&1", "1>&2", "2>/dev/null", ">/dev/null", "> /dev/null"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalPolicy {
    /// First kubectl argument of commands that only read cluster state.
    pub kubectl_read_only: Vec<String>,
    pub kubectl_write: Vec<String>,
    /// Matched against every kubectl argument, so flags such as `--force` count.
    pub kubectl_dangerous: Vec<String>,
    /// Programs whose every pipeline stage leaves the host unchanged.
    pub bash_read_only: Vec<String>,
    pub bash_write: Vec<String>,
    /// Programs that run another command, so the stage is judged as a write.
    pub bash_wrappers: Vec<String>,
    /// `program option` pairs that turn an otherwise read-only program into a write,
    /// e.g. `sort -o`.
    pub bash_write_options: Vec<String>,
    /// Substrings of the whole script.
    pub bash_dangerous: Vec<String>,
    /// Category for commands no list recognises.
    pub unknown_category: ApprovalCategory,
    /// Category for tools other than `kubectl` and `bash`.
    pub external_tool_category: ApprovalCategory,
    /// Categories that run without asking.
    pub auto_approve: Vec<ApprovalCategory>,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            kubectl_read_only: strings(&[
                "get",
                "describe",
                "logs",
                "top",
                "explain",
                "events",
                "api-resources",
                "api-versions",
                "cluster-info",
                "version",
                "diff",
            ]),
            kubectl_write: strings(&[
                "apply",
                "create",
                "edit",
                "patch",
                "replace",
                "label",
                "annotate",
                "scale",
                "autoscale",
                "rollout",
                "set",
                "expose",
                "run",
                "exec",
                "cp",
                "port-forward",
                "cordon",
                "uncordon",
                "taint",
                "config",
            ]),
            kubectl_dangerous: strings(&[
                "delete",
                "drain",
                "--force",
                "--grace-period=0",
                "--all",
            ]),
            bash_read_only: strings(&[
                "ls", "cat", "head", "tail", "less", "grep", "egrep", "cut", "sort", "wc",
                "echo", "printf", "pwd", "whoami", "id", "uname", "uptime", "df", "du", "free",
                "ps", "pgrep", "stat", "file", "which", "printenv", "lsblk", "netstat",
                "nslookup", "dig", "ping", "true",
            ]),
            bash_write: strings(&[
                "rm", "mv", "cp", "mkdir", "rmdir", "touch", "ln", "chmod", "chown", "tee",
                "sed", "truncate", "kill", "pkill", "systemctl", "service", "apt", "apt-get",
                "yum", "dnf", "pip", "npm", "docker", "git", "sudo", "crontab", "useradd",
                "usermod", "mount", "umount", "kubectl", "helm", "curl", "wget", "ip",
                "date", "hostname", "hostnamectl", "journalctl", "dmesg", "ss", "iptables",
            ]),
            bash_wrappers: strings(&[
                "env", "nice", "ionice", "timeout", "xargs", "nohup", "time", "stdbuf", "watch",
                "command", "exec", "eval", "source", ".", "sh", "bash", "zsh", "setsid",
                "chroot", "flock", "su", "awk", "find",
            ]),
            bash_write_options: strings(&["sort -o", "sort --output"]),
            bash_dangerous: strings(&[
                "rm -rf",
                "rm -fr",
                "mkfs",
                "dd if=",
                "shutdown",
                "reboot",
                "poweroff",
                "halt",
                ":(){",
                "> /dev/sd",
                "kill -9",
                "killall",
                "iptables -f",
                "chmod -r 777",
                "-delete",
            ]),
            unknown_category: ApprovalCategory::Write,
            external_tool_category: ApprovalCategory::Write,
            auto_approve: vec![ApprovalCategory::ReadOnly],
        }
    }
}

impl ApprovalPolicy {
    /// Reject empty entries and words listed both as read-only and as write or dangerous.
    pub fn validate(&self) -> Result<(), ApprovalError> {
        let lists = [
            ("kubectl_read_only", &self.kubectl_read_only),
            ("kubectl_write", &self.kubectl_write),
            ("kubectl_dangerous", &self.kubectl_dangerous),
            ("bash_read_only", &self.bash_read_only),
            ("bash_write", &self.bash_write),
            ("bash_dangerous", &self.bash_dangerous),
            ("bash_wrappers", &self.bash_wrappers),
            ("bash_write_options", &self.bash_write_options),
        ];
        for (name, list) in lists {
            if list.iter().any(|entry| entry.trim().is_empty()) {
                return Err(ApprovalError::InvalidPolicy(format!("{name} contains an empty entry")));
            }
        }

        let conflicts = |read_only: &[String], others: &[&[String]]| {
            read_only
                .iter()
                .find(|word| others.iter().any(|list| list.contains(word)))
                .cloned()
        };
        if let Some(word) = conflicts(
            &self.kubectl_read_only,
            &[self.kubectl_write.as_slice(), self.kubectl_dangerous.as_slice()],
        ) {
            return Err(ApprovalError::InvalidPolicy(format!(
                "kubectl verb '{word}' is listed as both read-only and mutating"
            )));
        }
        if let Some(word) = conflicts(
            &self.bash_read_only,
            &[self.bash_write.as_slice(), self.bash_wrappers.as_slice()],
        ) {
            return Err(ApprovalError::InvalidPolicy(format!(
                "program '{word}' is listed as both read-only and mutating"
            )));
        }
        if let Some(entry) = self
            .bash_write_options
            .iter()
            .find(|entry| entry.split_whitespace().count() != 2)
        {
            return Err(ApprovalError::InvalidPolicy(format!(
                "bash_write_options entry '{entry}' must be 'program option'"
            )));
        }

        if self.auto_approve.contains(&ApprovalCategory::Dangerous) {
            log::warn!("approval policy auto-approves dangerous commands");
        }
        Ok(())
    }

    pub fn is_auto_approved(&self, category: ApprovalCategory) -> bool {
        self.auto_approve.contains(&category)
    }

    /// Render the command a human would approve and decide its category.
    ///
    /// Dangerous beats write, write beats read-only.
    pub fn classify(&self, tool_name: &str, arguments: &Value) -> (String, ApprovalCategory) {
        match tool_name {
            "kubectl" => self.classify_kubectl(arguments),
            "bash" => self.classify_bash(arguments),
            other => {
                let rendered = format!("{other} {arguments}");
                (rendered, self.external_tool_category)
            }
        }
    }

    fn classify_kubectl(&self, arguments: &Value) -> (String, ApprovalCategory) {
        let Ok(words) = render_kubectl_args(arguments) else {
            let raw = arguments
                .get("command")
                .and_then(Value::as_str)
                .unwrap_or_default();
            return (format!("kubectl {raw}").trim_end().to_string(), self.unknown_category);
        };
        let rendered = format!("kubectl {}", shell_words::join(&words));

        let lowered: Vec<String> = words.iter().map(|word| word.to_lowercase()).collect();
        let category = if lowered
            .iter()
            .any(|word| self.kubectl_dangerous.iter().any(|entry| entry == word))
        {
            ApprovalCategory::Dangerous
        } else if self.kubectl_write.contains(&lowered[0]) {
            ApprovalCategory::Write
        } else if self.kubectl_read_only.contains(&lowered[0]) {
            ApprovalCategory::ReadOnly
        } else {
            self.unknown_category
        };
        (rendered, category)
    }

    fn classify_bash(&self, arguments: &Value) -> (String, ApprovalCategory) {
        let script = arguments
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        if script.is_empty() {
            return (script, self.unknown_category);
        }

        let lowered = script.to_lowercase();
        if self
            .bash_dangerous
            .iter()
            .any(|pattern| lowered.contains(&pattern.to_lowercase()))
        {
            return (script, ApprovalCategory::Dangerous);
        }

        let mut unredirected = lowered.clone();
        for harmless in HARMLESS_REDIRECTS {
            unredirected = unredirected.replace(harmless, " ");
        }
        if unredirected.contains('>') {
            return (script, ApprovalCategory::Write);
        }

        // Substitutions can run anything.
        if lowered.contains("$(") || lowered.contains('`') {
            return (script, self.unknown_category);
        }

        let stages = pipeline_stages(&unredirected);
        let category = if stages.iter().any(|stage| self.stage_writes(stage)) {
            ApprovalCategory::Write
        } else if !stages.is_empty()
            && stages
                .iter()
                .all(|stage| self.bash_read_only.contains(&stage[0]))
        {
            ApprovalCategory::ReadOnly
        } else {
            self.unknown_category
        };
        (script, category)
    }

    fn stage_writes(&self, stage: &[String]) -> bool {
        let program = &stage[0];
        if self.bash_write.contains(program) || self.bash_wrappers.contains(program) {
            return true;
        }
        self.bash_write_options.iter().any(|entry| {
            let mut parts = entry.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(listed), Some(option)) if listed == program => {
                    stage[1..].iter().any(|word| option_matches(word, option))
                }
                _ => false,
            }
        })
    }
}

/// Words of every stage separated by `|`, `;`, `&` or newlines. Leading
/// `VAR=value` assignments are skipped and the program is reduced to its
/// file name, so every returned stage starts with a program.
fn pipeline_stages(script: &str) -> Vec<Vec<String>> {
    script
        .split(|c: char| matches!(c, '|' | ';' | '&' | '\n' | '(' | ')'))
        .filter_map(|stage| {
            let mut words = stage
                .split_whitespace()
                .skip_while(|word| word.contains('='))
                .map(str::to_string);
            let program = words.next()?;
            let program = program.rsplit('/').next().unwrap_or(&program).to_string();
            Some(std::iter::once(program).chain(words).collect())
        })
        .collect()
}

/// `--output` matches `--output` and `--output=x`; `-o` also matches
/// bundled short flags such as `-uo`.
fn option_matches(word: &str, option: &str) -> bool {
    if option.starts_with("--") {
        return word == option || word.starts_with(&format!("{option}="));
    }
    match (option.strip_prefix('-'), word.strip_prefix('-')) {
        (Some(letters), Some(flags)) if !flags.starts_with('-') => {
            letters.chars().all(|letter| flags.contains(letter))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn category(tool: &str, command: &str) -> ApprovalCategory {
        ApprovalPolicy::default()
            .classify(tool, &json!({ "command": command }))
            .1
    }

    #[test]
    fn default_policy_is_valid() {
        ApprovalPolicy::default().validate().unwrap();
    }

    #[test]
    fn kubectl_categories() {
        assert_eq!(category("kubectl", "get pods -n default"), ApprovalCategory::ReadOnly);
        assert_eq!(category("kubectl", "logs web-0 --tail=50"), ApprovalCategory::ReadOnly);
        assert_eq!(category("kubectl", "scale deploy/web --replicas=3"), ApprovalCategory::Write);
        assert_eq!(category("kubectl", "delete pod web-0"), ApprovalCategory::Dangerous);
        assert_eq!(
            category("kubectl", "apply -f x.yaml --force"),
            ApprovalCategory::Dangerous
        );
        assert_eq!(category("kubectl", "plugin-thing foo"), ApprovalCategory::Write);
    }

    #[test]
    fn kubectl_rendering_includes_namespace() {
        let (rendered, category) = ApprovalPolicy::default().classify(
            "kubectl",
            &json!({"command": "kubectl get pods", "namespace": "default"}),
        );
        assert_eq!(rendered, "kubectl get pods -n default");
        assert_eq!(category, ApprovalCategory::ReadOnly);
    }

    #[test]
    fn bash_categories() {
        assert_eq!(category("bash", "df -h | sort -k5"), ApprovalCategory::ReadOnly);
        assert_eq!(category("bash", "ps aux 2>&1 | grep nginx"), ApprovalCategory::ReadOnly);
        assert_eq!(category("bash", "/bin/ls -la /var/log"), ApprovalCategory::ReadOnly);
        assert_eq!(category("bash", "echo hi > /etc/motd"), ApprovalCategory::Write);
        assert_eq!(category("bash", "ls && rm notes.txt"), ApprovalCategory::Write);
        assert_eq!(category("bash", "systemctl restart nginx"), ApprovalCategory::Write);
        assert_eq!(category("bash", "rm -rf /tmp/cache"), ApprovalCategory::Dangerous);
        assert_eq!(category("bash", "sudo REBOOT"), ApprovalCategory::Dangerous);
        assert_eq!(category("bash", "echo $(whoami)"), ApprovalCategory::Write);
        assert_eq!(category("bash", "my-script.sh"), ApprovalCategory::Write);
    }

    #[test]
    fn state_changing_network_and_system_tools_need_approval() {
        for command in [
            "ip route del default",
            "ip addr show",
            "curl -X DELETE http://127.0.0.1:8001/api/v1/namespaces/prod",
            "curl -s http://localhost:8080/healthz",
            "date -s '2000-01-01'",
            "hostname db-1",
            "journalctl --vacuum-size=1K",
            "dmesg -C",
        ] {
            assert_eq!(category("bash", command), ApprovalCategory::Write, "{command}");
        }
    }

    #[test]
    fn wrapped_commands_are_never_read_only() {
        assert_eq!(
            category("bash", "env kubectl delete deployment web -n prod"),
            ApprovalCategory::Write
        );
        assert_eq!(category("bash", "env"), ApprovalCategory::Write);
        assert_eq!(category("bash", "LANG=C nice -n 10 ls"), ApprovalCategory::Write);
        assert_eq!(category("bash", "timeout 5 cat /etc/hosts"), ApprovalCategory::Write);
        assert_eq!(category("bash", "ls | xargs cat"), ApprovalCategory::Write);
        assert_eq!(category("bash", "sh -c 'ls'"), ApprovalCategory::Write);
        assert_eq!(category("bash", "find / -name core -delete"), ApprovalCategory::Dangerous);
        assert_eq!(category("bash", "LANG=C ls -la"), ApprovalCategory::ReadOnly);
    }

    #[test]
    fn write_options_flip_read_only_programs() {
        assert_eq!(category("bash", "sort -u names.txt"), ApprovalCategory::ReadOnly);
        assert_eq!(category("bash", "sort -o names.txt names.txt"), ApprovalCategory::Write);
        assert_eq!(category("bash", "sort -uo names.txt names.txt"), ApprovalCategory::Write);
        assert_eq!(category("bash", "sort --output=names.txt x"), ApprovalCategory::Write);
        assert!(option_matches("--output", "--output"));
        assert!(!option_matches("--output-format", "--output"));
        assert!(!option_matches("--only", "-o"));
    }

    #[test]
    fn external_tools_use_configured_category() {
        let mut policy = ApprovalPolicy::default();
        let (rendered, category) = policy.classify("search_docs", &json!({"q": "pods"}));
        assert_eq!(rendered, r#"search_docs {"q":"pods"}"#);
        assert_eq!(category, ApprovalCategory::Write);

        policy.external_tool_category = ApprovalCategory::ReadOnly;
        assert_eq!(
            policy.classify("search_docs", &json!({})).1,
            ApprovalCategory::ReadOnly
        );
    }

    #[test]
    fn validate_rejects_conflicting_lists() {
        let mut policy = ApprovalPolicy::default();
        policy.kubectl_read_only.push("delete".to_string());
        assert!(matches!(policy.validate(), Err(ApprovalError::InvalidPolicy(_))));

        let mut policy = ApprovalPolicy::default();
        policy.bash_write.push(" ".to_string());
        assert!(policy.validate().is_err());

        let mut policy = ApprovalPolicy::default();
        policy.bash_read_only.push("env".to_string());
        assert!(matches!(policy.validate(), Err(ApprovalError::InvalidPolicy(_))));

        let mut policy = ApprovalPolicy::default();
        policy.bash_write_options.push("sort".to_string());
        assert!(policy.validate().is_err());
    }

    #[test]
    fn deserializes_partial_policy() {
        let policy: ApprovalPolicy =
            serde_json::from_str(r#"{"auto_approve": ["read_only", "write"]}"#).unwrap();
        assert!(policy.is_auto_approved(ApprovalCategory::Write));
        assert!(!policy.is_auto_approved(ApprovalCategory::Dangerous));
        assert_eq!(policy.unknown_category, ApprovalCategory::Write);
    }
}
