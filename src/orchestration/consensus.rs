//! Multi-voter approval for high-risk changes.

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::config::ConsensusConfig;
use crate::core::TaskNode;
use crate::decode::{decode_json, Decoded};
use crate::guard::UsageReceipt;
use crate::lane::LaneMetrics;
use crate::orchestration::model::{ChatMessage, ModelGateway};
use crate::orchestration::worker::{describe_node, WorkerArtifact};
use crate::{llog, Error, Result};

/// One voter's ballot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub voter: String,
    pub approved: bool,
    pub rationale: String,
}

/// Ballots plus the quorum decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusOutcome {
    pub votes: Vec<Vote>,
    pub approvals: usize,
    pub quorum: usize,
    pub approved: bool,
}

impl ConsensusOutcome {
    /// Approved iff at least `quorum` votes approve.
    pub fn evaluate(votes: Vec<Vote>, quorum: usize) -> Self {
        let approvals = votes.iter().filter(|v| v.approved).count();
        Self {
            approved: approvals >= quorum,
            votes,
            approvals,
            quorum,
        }
    }

    /// Rework notes built from the rejecting ballots.
    pub fn feedback(&self) -> String {
        let mut out = format!(
            "Consensus rejected the change ({} of {} required approvals).",
            self.approvals, self.quorum
        );
        for vote in self.votes.iter().filter(|v| !v.approved) {
            out.push_str(&format!("\n- {}: {}", vote.voter, vote.rationale));
        }
        out
    }
}

pub fn requires_consensus(node: &TaskNode, config: &ConsensusConfig) -> bool {
    config.enabled && node.risk_level >= config.min_risk
}

#[derive(Debug, Deserialize)]
struct Ballot {
    approved: bool,
    #[serde(default)]
    rationale: String,
}

const VOTER_SYSTEM: &str = "You are one of several independent reviewers deciding whether a \
high-risk change may merge. Reply with JSON only: {\"approved\": bool, \"rationale\": string}.";

async fn cast(
    gateway: &ModelGateway,
    voter: &str,
    prompt: &str,
) -> Result<(Vote, Option<UsageReceipt>)> {
    let messages = [ChatMessage::system(VOTER_SYSTEM), ChatMessage::user(prompt)];
    let reply = match gateway.call(voter, &messages).await {
        Ok(reply) => reply,
        Err(e) if e.halts_run() => return Err(e),
        Err(e) => {
            let vote = Vote {
                voter: voter.to_string(),
                approved: false,
                rationale: format!("no vote: {}", e),
            };
            return Ok((vote, None));
        }
    };

    let vote = match decode_json(&reply.content, || Ballot {
        approved: false,
        rationale: String::new(),
    }) {
        Decoded::Parsed(ballot) => Vote {
            voter: voter.to_string(),
            approved: ballot.approved,
            rationale: ballot.rationale,
        },
        Decoded::Fallback(_) => Vote {
            voter: voter.to_string(),
            approved: false,
            rationale: "ballot could not be parsed".to_string(),
        },
    };
    Ok((vote, Some(reply.receipt)))
}

/// Collect one independent vote per configured voter, concurrently.
pub async fn collect_votes(
    gateway: &ModelGateway,
    config: &ConsensusConfig,
    node: &TaskNode,
    artifact: &WorkerArtifact,
    metrics: &mut LaneMetrics,
) -> Result<ConsensusOutcome> {
    let prompt = format!(
        "{}\nProposed change:\n{}\nFiles: {}",
        describe_node(node),
        artifact.summary,
        artifact
            .files
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let ballots = join_all(
        config
            .voters
            .iter()
            .map(|voter| cast(gateway, voter, &prompt)),
    )
    .await;

    let mut votes = Vec::with_capacity(ballots.len());
    let mut fatal: Option<Error> = None;
    for ballot in ballots {
        match ballot {
            Ok((vote, receipt)) => {
                if let Some(receipt) = receipt {
                    metrics.add_usage(&receipt);
                }
                votes.push(vote);
            }
            Err(e) => {
                fatal.get_or_insert(e);
            }
        }
    }
    if let Some(e) = fatal {
        return Err(e);
    }

    let outcome = ConsensusOutcome::evaluate(votes, config.quorum);
    llog!(
        "consensus for {}: {}/{} approvals (quorum {})",
        node.id,
        outcome.approvals,
        outcome.votes.len(),
        outcome.quorum
    );
    Ok(outcome)
}
