//! Code-hosting port that records proposals as branches in a local git
//! repository.
//!
//! Each proposal is one commit on `<prefix>/<proposal-id>`, created from the
//! current branch. The proposal id is derived from the invocation key, so a
//! replayed invocation finds its branch and returns the same id.
//!
//! A proposal abandoned mid-way (the caller's future dropped on timeout) is
//! rolled back at the next step, so no branch outlives a failed attempt.

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use tracing::{info, instrument, warn};

use crate::io::git::Git;
use crate::io::process::CancelFlag;
use crate::io::ports::{
    CapabilityPort, CapabilityRequest, CapabilityResponse, Invocation, PortFailure,
};

#[derive(Debug, Clone)]
pub struct GitCodeHost {
    repo: PathBuf,
    branch_prefix: String,
}

impl GitCodeHost {
    pub fn new(repo: impl Into<PathBuf>, branch_prefix: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            branch_prefix: branch_prefix.into(),
        }
    }

    fn branch_for(&self, proposal_id: &str) -> String {
        format!("{}/{proposal_id}", self.branch_prefix.trim_end_matches('/'))
    }
}

/// `task-1a2b:3` becomes `proposal-task-1a2b-3`.
pub fn proposal_id_for(key: &str) -> String {
    let slug: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    format!("proposal-{slug}")
}

fn checkpoint(cancel: &CancelFlag) -> Result<()> {
    if cancel.is_cancelled() {
        bail!("proposal cancelled");
    }
    Ok(())
}

#[instrument(skip_all, fields(branch = %branch))]
fn propose_blocking(
    git: &Git,
    branch: &str,
    description: &str,
    diff: &str,
    cancel: &CancelFlag,
) -> Result<bool> {
    if git.branch_exists(branch)? {
        return Ok(false);
    }
    git.ensure_clean().context("refuse to propose over local changes")?;
    let original = git.current_branch()?;
    git.checkout_new_branch(branch)?;

    let committed = checkpoint(cancel)
        .and_then(|()| git.apply_to_index(diff))
        .and_then(|()| checkpoint(cancel))
        .and_then(|()| git.commit_staged(description))
        .and_then(|made| checkpoint(cancel).map(|()| made));
    match committed {
        Ok(true) => {
            git.checkout_branch(&original)?;
            Ok(true)
        }
        outcome => {
            // Roll back to where we started so the next attempt sees a clean
            // repository and no half-made branch.
            if let Err(err) = git
                .reset_hard()
                .and_then(|()| git.checkout_branch(&original))
                .and_then(|()| git.delete_branch(branch))
            {
                warn!(err = %format!("{err:#}"), "failed to roll back proposal branch");
            }
            match outcome {
                Ok(_) => Err(anyhow!("diff produced no changes")),
                Err(err) => Err(err),
            }
        }
    }
}

#[async_trait]
impl CapabilityPort for GitCodeHost {
    fn name(&self) -> &str {
        "git"
    }

    async fn invoke(&self, invocation: &Invocation) -> Result<CapabilityResponse, PortFailure> {
        let CapabilityRequest::ProposeChange { description, diff } = &invocation.request else {
            return Err(PortFailure::Unsupported {
                port: self.name().to_string(),
                request: invocation.request.kind(),
            });
        };
        if diff.trim().is_empty() {
            return Err(PortFailure::Rejected("diff is empty".to_string()));
        }

        let proposal_id = proposal_id_for(&invocation.key);
        let branch = self.branch_for(&proposal_id);
        let git = Git::new(&self.repo);
        let description = description.clone();
        let diff = diff.clone();
        let branch_for_task = branch.clone();
        let cancel = CancelFlag::default();
        let _rollback_on_drop = cancel.cancel_on_drop();
        let created = tokio::task::spawn_blocking(move || {
            propose_blocking(&git, &branch_for_task, &description, &diff, &cancel)
        })
        .await
        .map_err(|err| PortFailure::Unavailable(format!("code host worker failed: {err}")))?
        .map_err(|err| PortFailure::Rejected(format!("{err:#}")))?;

        if created {
            info!(branch = %branch, "proposal branch created");
        } else {
            info!(branch = %branch, "proposal already exists");
        }
        Ok(CapabilityResponse::Proposal { proposal_id })
    }
}
