//! Admin commands run from the command line.
//!
//! Each command maps onto one [`Admin`] operation and prints its result as JSON.

use crate::admin::{Admin, DomainRuleImport};
use crate::db::AttachmentRuleInput;
use crate::error::Error;
use crate::tracker::{Lookup, ProcessingStatus};
use serde::Serialize;
use std::path::{Path, PathBuf};

pub const USAGE: &str = "\
  status <tracker_id>
  advance <tracker_id> <pending|processing|completed|rejected> [comment]
  stats
  domain-rules
  allow-domain <domain> [description]
  block-domain <domain> [description]
  remove-domain <domain>
  import-domains <rules.json>
  attachment-rules
  set-attachment-rule <rule.json>
  remove-attachment-rule <name>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status(String),
    Advance {
        tracker_id: String,
        status: ProcessingStatus,
        comment: Option<String>,
    },
    Stats,
    DomainRules,
    SetDomain {
        domain: String,
        allowed: bool,
        description: String,
    },
    RemoveDomain(String),
    ImportDomains(PathBuf),
    AttachmentRules,
    SetAttachmentRule(PathBuf),
    RemoveAttachmentRule(String),
}

impl Command {
    pub fn parse(name: &str, args: &[String]) -> Result<Self, Error> {
        let arg = |i: usize| {
            args.get(i)
                .cloned()
                .ok_or_else(|| Error::InvalidInput(format!("`{name}` is missing an argument")))
        };
        let rest = |i: usize| args.get(i..).map(|words| words.join(" ")).unwrap_or_default();

        Ok(match name {
            "status" => Self::Status(arg(0)?),
            "advance" => {
                let status = arg(1)?;
                Self::Advance {
                    tracker_id: arg(0)?,
                    status: ProcessingStatus::parse(&status).ok_or_else(|| {
                        Error::InvalidInput(format!("`{status}` is not a status"))
                    })?,
                    comment: Some(rest(2)).filter(|c| !c.is_empty()),
                }
            }
            "stats" => Self::Stats,
            "domain-rules" => Self::DomainRules,
            "allow-domain" | "block-domain" => Self::SetDomain {
                domain: arg(0)?,
                allowed: name == "allow-domain",
                description: rest(1),
            },
            "remove-domain" => Self::RemoveDomain(arg(0)?),
            "import-domains" => Self::ImportDomains(arg(0)?.into()),
            "attachment-rules" => Self::AttachmentRules,
            "set-attachment-rule" => Self::SetAttachmentRule(arg(0)?.into()),
            "remove-attachment-rule" => Self::RemoveAttachmentRule(arg(0)?),
            other => return Err(Error::InvalidInput(format!("unknown command `{other}`"))),
        })
    }

    /// Runs the command and returns what should be printed.
    pub async fn run(self, admin: &Admin) -> Result<String, Error> {
        match self {
            Self::Status(tracker_id) => match admin.lookup(&tracker_id).await? {
                Lookup::Found(view) => to_json(&view),
                Lookup::NotFound => Err(Error::NotFound(tracker_id)),
            },
            Self::Advance {
                tracker_id,
                status,
                comment,
            } => to_json(
                &admin
                    .advance_status(&tracker_id, status, None, comment)
                    .await?,
            ),
            Self::Stats => to_json(&admin.stats().await?),
            Self::DomainRules => to_json(&admin.list_domain_rules().await?),
            Self::SetDomain {
                domain,
                allowed,
                description,
            } => to_json(
                &admin
                    .set_domain_rule(&domain, allowed, &description)
                    .await?,
            ),
            Self::RemoveDomain(domain) => removed(admin.delete_domain_rule(&domain).await?, domain),
            Self::ImportDomains(path) => {
                let rows: Vec<DomainRuleImport> = read_json(&path).await?;
                to_json(&admin.import_domain_rules(&rows).await)
            }
            Self::AttachmentRules => to_json(&admin.list_attachment_rules().await?),
            Self::SetAttachmentRule(path) => {
                let rule: AttachmentRuleInput = read_json(&path).await?;
                to_json(&admin.set_attachment_rule(&rule).await?)
            }
            Self::RemoveAttachmentRule(name) => {
                removed(admin.delete_attachment_rule(&name).await?, name)
            }
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String, Error> {
    Ok(serde_json::to_string_pretty(value)?)
}

fn removed(deleted: bool, what: String) -> Result<String, Error> {
    if deleted {
        Ok(format!("Removed {what}"))
    } else {
        Err(Error::NotFound(what))
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, Error> {
    let raw = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::db::Repository;
    use crate::db::tests::{new_upload, test_repository};
    use crate::fetcher::tests::FakeFetcher;
    use crate::service::Service;
    use rstest::*;
    use std::sync::Arc;
    use testresult::TestResult;

    fn args(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[rstest]
    #[case("stats", &[], Command::Stats)]
    #[case("status", &["email-1a2b3c4d-9f0e-4821"], Command::Status("email-1a2b3c4d-9f0e-4821".into()))]
    #[case("advance", &["ID", "Rejected", "not", "readable"], Command::Advance {
        tracker_id: "ID".into(),
        status: ProcessingStatus::Rejected,
        comment: Some("not readable".into()),
    })]
    #[case("advance", &["ID", "processing"], Command::Advance {
        tracker_id: "ID".into(),
        status: ProcessingStatus::Processing,
        comment: None,
    })]
    #[case("block-domain", &["spam.example"], Command::SetDomain {
        domain: "spam.example".into(),
        allowed: false,
        description: String::new(),
    })]
    fn test_parse(#[case] name: &str, #[case] words: &[&str], #[case] expected: Command) -> TestResult {
        assert_eq!(Command::parse(name, &args(words))?, expected);
        Ok(())
    }

    #[rstest]
    #[case("status", &[])]
    #[case("advance", &["ID", "archived"])]
    #[case("frobnicate", &[])]
    fn test_parse_rejects(#[case] name: &str, #[case] words: &[&str]) {
        assert!(matches!(
            Command::parse(name, &args(words)),
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_commands_against_service() -> TestResult {
        let (dir, repo) = test_repository().await?;
        let repo = Arc::new(repo);
        let mut config = test_config();
        config.upload_dir = dir.path().join("uploads");
        repo.create_upload(&new_upload("EMAIL-1A2B3C4D-9F0E-4821", "report.pdf"))
            .await?;
        let service =
            Service::with_components(&config, repo, Arc::new(FakeFetcher::default()), None);
        let admin = service.admin();

        let status = Command::parse("status", &args(&["email-1a2b3c4d-9f0e-4821"]))?
            .run(&admin)
            .await?;
        assert!(status.contains("\"pending\""));

        let rules = dir.path().join("rules.json");
        tokio::fs::write(
            &rules,
            r#"[{"domain": "uni.edu"}, {"domain": "not a domain", "is_allowed": false}]"#,
        )
        .await?;
        let report = Command::ImportDomains(rules).run(&admin).await?;
        assert!(report.contains("\"success\": 1"));
        assert!(report.contains("\"failed\": 1"));

        let removed = Command::RemoveDomain("uni.edu".into()).run(&admin).await?;
        assert_eq!(removed, "Removed uni.edu");
        assert!(matches!(
            Command::RemoveDomain("uni.edu".into()).run(&admin).await,
            Err(Error::NotFound(_))
        ));

        let stats = Command::Stats.run(&admin).await?;
        assert!(stats.contains("\"total\": 1"));
        Ok(())
    }
}
