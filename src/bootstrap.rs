//! Company bootstrap: charter/budget/roster documents, CEO workspace reset,
//! and the seed channel.
//!
//! Workspace files are opaque text as far as the core is concerned — agents
//! rewrite them freely once running. Bootstrap only guarantees they exist
//! with a sane starting shape.

use crate::channels::{ChannelStore, ChannelType, CreateChannelInput};
use crate::config::CompanyConfig;
use crate::db::{SEED_CHANNEL_MEMBERS, SEED_CHANNEL_NAME};
use crate::error::Result;
use anyhow::Context as _;
use std::path::Path;

/// Files written into every agent workspace.
const WORKSPACE_FILES: [(&str, &str); 6] = [
    (
        "SOUL.md",
        "# SOUL\n\nYou are a member of a small autonomous company. Do real work, \
         write things down, and ask for help in channels when blocked.\n",
    ),
    (
        "IDENTITY.md",
        "# IDENTITY\n\nRole and responsibilities live here. Update this file \
         when your role changes.\n",
    ),
    (
        "MEMORY.md",
        "# MEMORY\n\nLong-lived notes. Daily notes go in memory/YYYY-MM-DD.md.\n",
    ),
    (
        "HEARTBEAT.md",
        "# HEARTBEAT\n\nWhile a task is in flight, heartbeat it with \
         tasks.heartbeat so the watchdog knows you are alive.\n",
    ),
    (
        "TOOLS.md",
        "# TOOLS\n\nChannel operations: company.channels.post / .history.\n\
         Task operations: tasks.create / .update / .log / .heartbeat.\n",
    ),
    (
        "AGENTS.md",
        "# AGENTS\n\nThe current roster is in company/ROSTER.md. Reach \
         teammates through shared channels.\n",
    ),
];

/// What `company.create` produced, echoed back to the caller.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapReport {
    pub charter_written: bool,
    pub roster_written: bool,
    pub seed_channel_id: String,
}

/// Initialize a new company around the given goal.
///
/// Idempotent: documents are rewritten, the seed channel is created only if
/// missing.
pub async fn create_company(
    config: &CompanyConfig,
    channel_store: &ChannelStore,
    goal: &str,
) -> Result<BootstrapReport> {
    let company_dir = config.company_dir();
    tokio::fs::create_dir_all(company_dir.join("kb"))
        .await
        .context("failed to create company directory")?;

    write_file(&company_dir.join("CHARTER.md"), &charter_template(goal)).await?;
    write_file(&company_dir.join("BUDGET.md"), BUDGET_TEMPLATE).await?;
    write_file(
        &company_dir.join("ROSTER.md"),
        &roster_template(config),
    )
    .await?;

    reset_workspace(&config.workspace_dir()).await?;

    let seed_channel_id = match channel_store.resolve_channel(SEED_CHANNEL_NAME).await? {
        Some(channel) => channel.id,
        None => {
            let channel = channel_store
                .create_channel(CreateChannelInput {
                    name: SEED_CHANNEL_NAME.to_string(),
                    channel_type: ChannelType::Private,
                    description: "Investor updates and asks".to_string(),
                    created_by: "main".to_string(),
                    members: SEED_CHANNEL_MEMBERS
                        .iter()
                        .map(|id| id.to_string())
                        .collect(),
                })
                .await?;
            channel.channel.id
        }
    };

    tracing::info!(goal, "company bootstrapped");
    Ok(BootstrapReport {
        charter_written: true,
        roster_written: true,
        seed_channel_id,
    })
}

/// Reset an agent workspace to the template files. Existing daily memory
/// notes are left alone.
pub async fn reset_workspace(workspace: &Path) -> Result<()> {
    tokio::fs::create_dir_all(workspace.join("memory"))
        .await
        .context("failed to create workspace directory")?;

    for (name, content) in WORKSPACE_FILES {
        write_file(&workspace.join(name), content).await?;
    }
    Ok(())
}

async fn write_file(path: &Path, content: &str) -> Result<()> {
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("failed to write {}", path.display()))
        .map_err(Into::into)
}

fn charter_template(goal: &str) -> String {
    format!(
        "# CHARTER\n\n## Goal\n\n{goal}\n\n## Operating principles\n\n\
         - Everything durable goes through channels and task threads.\n\
         - Blocked work is flagged, not abandoned.\n\
         - The investor hears the truth in #{SEED_CHANNEL_NAME}.\n"
    )
}

const BUDGET_TEMPLATE: &str = "# BUDGET\n\n\
    | line | monthly | notes |\n\
    |------|---------|-------|\n\
    | inference | $0 | set by the operator |\n\
    | infrastructure | $0 | set by the operator |\n";

fn roster_template(config: &CompanyConfig) -> String {
    let mut roster = String::from(
        "# ROSTER\n\n| id | name | layer | role |\n|----|------|-------|------|\n",
    );
    for agent in &config.agents {
        roster.push_str(&format!(
            "| {} | {} | {} | {} |\n",
            agent.id, agent.name, agent.layer, agent.role
        ));
    }
    roster
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_channels_pool;

    #[tokio::test]
    async fn bootstrap_writes_documents_and_seed_channel() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = CompanyConfig::load_from_state_dir(dir.path().to_path_buf())
            .expect("config should load");
        let store = ChannelStore::new(memory_channels_pool().await);

        let report = create_company(&config, &store, "Be profitable by Q4")
            .await
            .expect("bootstrap should succeed");

        let charter = std::fs::read_to_string(config.company_dir().join("CHARTER.md"))
            .expect("charter should exist");
        assert!(charter.contains("Be profitable by Q4"));

        let roster = std::fs::read_to_string(config.company_dir().join("ROSTER.md"))
            .expect("roster should exist");
        assert!(roster.contains("| main |"));

        assert!(config.company_dir().join("BUDGET.md").exists());
        assert!(config.workspace_dir().join("SOUL.md").exists());
        assert!(config.workspace_dir().join("memory").is_dir());

        let channel = store
            .get_channel(SEED_CHANNEL_NAME)
            .await
            .expect("lookup should succeed")
            .expect("seed channel should exist");
        assert_eq!(channel.channel.id, report.seed_channel_id);
        let member_ids: Vec<&str> = channel
            .members
            .iter()
            .map(|member| member.member_id.as_str())
            .collect();
        assert!(member_ids.contains(&"investor"));
        assert!(member_ids.contains(&"main"));
    }

    #[tokio::test]
    async fn bootstrap_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = CompanyConfig::load_from_state_dir(dir.path().to_path_buf())
            .expect("config should load");
        let store = ChannelStore::new(memory_channels_pool().await);

        let first = create_company(&config, &store, "goal one")
            .await
            .expect("first bootstrap");
        let second = create_company(&config, &store, "goal two")
            .await
            .expect("second bootstrap");
        assert_eq!(first.seed_channel_id, second.seed_channel_id);

        let charter = std::fs::read_to_string(config.company_dir().join("CHARTER.md"))
            .expect("charter should exist");
        assert!(charter.contains("goal two"));
    }
}
