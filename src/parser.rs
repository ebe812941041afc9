//! Rules file front-end.
//!
//! Newline-delimited keyword/value records; each rule is a contiguous block
//! introduced by a `RULE` line. `#` starts a comment, blank lines are
//! skipped, and `INCLUDE` pulls in another file recursively. A trailing `$`
//! on the rule name marks an indexed template.

use crate::Result;
use crate::error::ParseError;
use crate::rule::{
    EndCondition, FailureAction, Rule, RuleDependency, RuleId, RuleState, START_COND_MAX_IDS,
    SchedPolicy, StartCondition, Timeout,
};
use std::fs;
use std::path::{Path, PathBuf};

const MAX_INCLUDE_DEPTH: usize = 10;

pub fn parse_file(path: &Path) -> Result<Vec<Rule>> {
    let mut rules = Vec::new();
    parse_into(path, &mut rules, 0)?;
    Ok(rules)
}

fn parse_into(path: &Path, rules: &mut Vec<Rule>, depth: usize) -> Result<()> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(ParseError::IncludeDepth {
            path: path.to_path_buf(),
        }
        .into());
    }
    let contents = fs::read_to_string(path).map_err(|e| ParseError::ReadError {
        path: path.to_path_buf(),
        details: Some(e.to_string()),
    })?;

    let mut block: Option<RuleBlock> = None;
    for (lineno, raw) in contents.lines().enumerate() {
        let lineno = lineno + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (keyword, rest) = match line.split_once(char::is_whitespace) {
            Some((kw, rest)) => (kw, rest.trim()),
            None => (line, ""),
        };
        match keyword {
            "RULE" => {
                if let Some(done) = block.take() {
                    rules.push(done.finish(path)?);
                }
                block = Some(RuleBlock::new(path, lineno, rest)?);
            }
            "INCLUDE" => {
                let include = resolve_include(path, rest);
                debug!("including rules file {}", include.display());
                parse_into(&include, rules, depth + 1)?;
            }
            "VERSION" => {
                // Informational only.
                trace!("rules file version {rest}");
            }
            _ => {
                let Some(block) = block.as_mut() else {
                    return Err(syntax(path, lineno, format!("'{keyword}' outside a RULE block")));
                };
                block.apply(path, lineno, keyword, rest)?;
            }
        }
    }
    if let Some(done) = block.take() {
        rules.push(done.finish(path)?);
    }
    Ok(())
}

fn resolve_include(parent: &Path, include: &str) -> PathBuf {
    let include = PathBuf::from(include);
    if include.is_absolute() {
        include
    } else {
        parent
            .parent()
            .map(|dir| dir.join(&include))
            .unwrap_or(include)
    }
}

fn syntax(path: &Path, line: usize, reason: String) -> miette::Report {
    ParseError::Syntax {
        path: path.to_path_buf(),
        line,
        reason,
    }
    .into()
}

struct RuleBlock {
    line: usize,
    id: RuleId,
    indexed: bool,
    start: Option<StartCondition>,
    end: Option<EndCondition>,
    timeout: Option<Timeout>,
    command: Option<String>,
    params: Option<String>,
    failure: Option<FailureAction>,
    active: Option<bool>,
    sched: SchedPolicy,
    daemon: bool,
    uid: u32,
}

impl RuleBlock {
    fn new(path: &Path, line: usize, name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(syntax(path, line, "RULE requires a <group>_<rule> id".to_string()));
        }
        // A '$' in the rule name marks an indexed template; the marker and
        // everything after it are stripped.
        let (name, indexed) = match name.split_once('$') {
            Some((prefix, _)) => (prefix, true),
            None => (name, false),
        };
        let id = RuleId::parse(name)?;
        Ok(Self {
            line,
            id,
            indexed,
            start: None,
            end: None,
            timeout: None,
            command: None,
            params: None,
            failure: None,
            active: None,
            sched: SchedPolicy::default(),
            daemon: false,
            uid: 0,
        })
    }

    fn apply(&mut self, path: &Path, line: usize, keyword: &str, rest: &str) -> Result<()> {
        match keyword {
            "START_COND" => self.start = Some(parse_start_cond(path, line, rest)?),
            "END_COND" => self.end = Some(parse_end_cond(path, line, rest)?),
            "END_COND_TIMEOUT" => {
                self.timeout = Some(match rest {
                    "-1" => Timeout::Forever,
                    ms => Timeout::Millis(ms.parse().map_err(|_| {
                        syntax(path, line, format!("invalid timeout '{ms}'"))
                    })?),
                });
            }
            "COMMAND" => match rest.split_once(char::is_whitespace) {
                Some((exe, args)) => {
                    self.command = Some(exe.to_string());
                    self.params = Some(args.trim().to_string());
                }
                None => {
                    if rest.is_empty() {
                        return Err(syntax(path, line, "COMMAND requires an executable".to_string()));
                    }
                    self.command = Some(rest.to_string());
                }
            },
            "FAILURE_ACTION" => {
                let mut parts = rest.split_ascii_whitespace();
                self.failure = Some(match parts.next() {
                    Some("NONE") => FailureAction::None,
                    Some("REBOOT") => FailureAction::Reboot,
                    Some("RESTART") => FailureAction::Restart,
                    Some("EXEC_RULE") => {
                        let target = parts.next().ok_or_else(|| {
                            syntax(path, line, "EXEC_RULE requires a rule id".to_string())
                        })?;
                        FailureAction::ExecRule(RuleId::parse(target)?)
                    }
                    other => {
                        return Err(syntax(
                            path,
                            line,
                            format!("unknown failure action '{}'", other.unwrap_or_default()),
                        ));
                    }
                });
            }
            "ACTIVE" => self.active = Some(rest == "YES"),
            "DAEMON" => self.daemon = rest == "YES",
            "SCHED" => {
                let mut parts = rest.split_ascii_whitespace();
                self.sched = match (parts.next(), parts.next()) {
                    (Some("NICE"), Some(v)) => {
                        let nice: i32 = v
                            .parse()
                            .map_err(|_| syntax(path, line, format!("invalid nice value '{v}'")))?;
                        if !(-20..=19).contains(&nice) {
                            return Err(syntax(path, line, format!("nice value {nice} out of range")));
                        }
                        SchedPolicy::Nice(nice)
                    }
                    (Some("FIFO"), Some(v)) => {
                        let prio: u32 = v.parse().map_err(|_| {
                            syntax(path, line, format!("invalid fifo priority '{v}'"))
                        })?;
                        if prio > 99 {
                            return Err(syntax(path, line, format!("fifo priority {prio} out of range")));
                        }
                        SchedPolicy::Fifo(prio)
                    }
                    _ => return Err(syntax(path, line, format!("invalid SCHED '{rest}'"))),
                };
            }
            "USER" => self.uid = parse_user(path, line, rest)?,
            other => {
                return Err(syntax(path, line, format!("unknown keyword '{other}'")));
            }
        }
        Ok(())
    }

    fn finish(self, path: &Path) -> Result<Rule> {
        let line = self.line;
        let path = path.to_path_buf();
        let missing = move |keyword| ParseError::IncompleteRule {
            path: path.clone(),
            line,
            keyword,
        };
        let end_cond = self.end.ok_or_else(|| missing("END_COND"))?;
        // A WAIT end condition carries its own countdown; the rule's overall
        // budget is forced to forever so the two never race.
        let timeout = if matches!(end_cond, EndCondition::Wait { .. }) {
            Timeout::Forever
        } else {
            self.timeout.ok_or_else(|| missing("END_COND_TIMEOUT"))?
        };
        let active = self.active.ok_or_else(|| missing("ACTIVE"))?;
        Ok(Rule {
            id: self.id,
            indexed: self.indexed,
            start_cond: self.start.ok_or_else(|| missing("START_COND"))?,
            end_cond,
            timeout,
            command: self.command.ok_or_else(|| missing("COMMAND"))?,
            params: self.params.filter(|p| !p.is_empty()),
            optional_params: None,
            failure_action: self.failure.ok_or_else(|| missing("FAILURE_ACTION"))?,
            sched: self.sched,
            daemon: self.daemon,
            uid: self.uid,
            state: if active {
                RuleState::Active
            } else {
                RuleState::Idle
            },
            proc: None,
        })
    }
}

fn parse_start_cond(path: &Path, line: usize, rest: &str) -> Result<StartCondition> {
    let mut parts = rest.split_ascii_whitespace();
    match parts.next() {
        Some("NONE") => Ok(StartCondition::None),
        Some("FILE") => {
            let file = parts
                .next()
                .ok_or_else(|| syntax(path, line, "FILE requires a path".to_string()))?;
            Ok(StartCondition::FileExists(PathBuf::from(file)))
        }
        Some("RULE_COMPLETED") => {
            let ids = parts
                .flat_map(|token| token.split(','))
                .filter(|t| !t.is_empty())
                .map(RuleId::parse)
                .collect::<Result<Vec<_>>>()?;
            if ids.is_empty() {
                return Err(syntax(path, line, "RULE_COMPLETED requires rule ids".to_string()));
            }
            if ids.len() > START_COND_MAX_IDS {
                return Err(syntax(
                    path,
                    line,
                    format!("RULE_COMPLETED lists {} ids, maximum is {START_COND_MAX_IDS}", ids.len()),
                ));
            }
            Ok(StartCondition::RulesCompleted(
                ids.into_iter().map(RuleDependency::new).collect(),
            ))
        }
        Some("NETDEVICE") => {
            let ifname = parts
                .next()
                .ok_or_else(|| syntax(path, line, "NETDEVICE requires an interface".to_string()))?;
            Ok(StartCondition::NetDeviceExists(ifname.to_string()))
        }
        Some("IPC_OWNER") => {
            let owner = parse_number(path, line, parts.next())?;
            Ok(StartCondition::IpcOwnerPresent(owner))
        }
        Some("ENV_VAR") => {
            let name = parts
                .next()
                .ok_or_else(|| syntax(path, line, "ENV_VAR requires a name".to_string()))?;
            let value = parts
                .next()
                .ok_or_else(|| syntax(path, line, "ENV_VAR requires a value".to_string()))?;
            Ok(StartCondition::EnvVarEquals {
                name: name.to_string(),
                value: value.to_string(),
            })
        }
        other => Err(syntax(
            path,
            line,
            format!("unknown start condition '{}'", other.unwrap_or_default()),
        )),
    }
}

fn parse_end_cond(path: &Path, line: usize, rest: &str) -> Result<EndCondition> {
    let mut parts = rest.split_ascii_whitespace();
    match parts.next() {
        Some("NONE") => Ok(EndCondition::None),
        Some("FILE") => {
            let file = parts
                .next()
                .ok_or_else(|| syntax(path, line, "FILE requires a path".to_string()))?;
            Ok(EndCondition::FileExists(PathBuf::from(file)))
        }
        Some("EXIT") => {
            let code: u32 = parse_number(path, line, parts.next())?;
            Ok(EndCondition::ExitStatus(code as i32))
        }
        Some("NETDEVICE") => {
            let ifname = parts
                .next()
                .ok_or_else(|| syntax(path, line, "NETDEVICE requires an interface".to_string()))?;
            Ok(EndCondition::NetDeviceExists(ifname.to_string()))
        }
        Some("IPC_OWNER") => {
            let owner = parse_number(path, line, parts.next())?;
            Ok(EndCondition::IpcOwnerPresent(owner))
        }
        Some("PROCESS_READY") => Ok(EndCondition::ProcessReady { ready: false }),
        Some("WAIT") => {
            let ms: u64 = parse_number(path, line, parts.next())? as u64;
            Ok(EndCondition::Wait {
                remaining_ms: ms,
                reload_ms: ms,
            })
        }
        other => Err(syntax(
            path,
            line,
            format!("unknown end condition '{}'", other.unwrap_or_default()),
        )),
    }
}

fn parse_number(path: &Path, line: usize, token: Option<&str>) -> Result<u32> {
    let token = token.ok_or_else(|| syntax(path, line, "missing numeric value".to_string()))?;
    token
        .parse()
        .map_err(|_| syntax(path, line, format!("invalid number '{token}'")))
}

/// USER accepts a numeric uid or an account name.
fn parse_user(path: &Path, line: usize, rest: &str) -> Result<u32> {
    if let Ok(uid) = rest.parse::<u32>() {
        return Ok(uid);
    }
    match nix::unistd::User::from_name(rest) {
        Ok(Some(user)) => Ok(user.uid.as_raw()),
        _ => Err(syntax(path, line, format!("unknown user '{rest}'"))),
    }
}
