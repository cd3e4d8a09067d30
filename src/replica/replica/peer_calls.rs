//! Spawned tasks that call a peer and post the reply back into the actor. None of these touch
//! replica state; they only translate the peer's answer into an event.

use crate::actor::WeakActorClient;
use crate::replica::local_state::Term;
use crate::replica::peers::ReplicaId;
use crate::replica::replica_api::{
    AppendEntriesError, AppendEntriesInput, InstallSnapshotError, InstallSnapshotInput, ReplicationReplyFromPeer,
    ReplicationReplyFromPeerDescriptor, ReplicationReplyFromPeerError, RequestVoteError, RequestVoteInput,
    RequestVoteReplyFromPeer, RequestVoteResult,
};
use crate::transport::{PeerClient, TransportError};
use std::sync::Arc;
use tokio::time::error::Elapsed;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

pub(super) struct PeerCall {
    pub(super) logger: slog::Logger,
    pub(super) client: Arc<dyn PeerClient>,
    pub(super) callback: WeakActorClient,
    pub(super) rpc_timeout: Duration,
    pub(super) cancel: CancellationToken,
}

pub(super) async fn call_peer_request_vote(
    call: PeerCall,
    peer_id: ReplicaId,
    input: RequestVoteInput,
    delay: Option<Duration>,
) {
    let term = input.candidate_term;
    let PeerCall {
        logger,
        client,
        callback,
        rpc_timeout,
        cancel,
    } = call;

    let rpc = async {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        slog::debug!(logger, "ClientWire - {:?}", input);
        tokio::time::timeout(rpc_timeout, client.request_vote(input)).await
    };
    let rpc_reply = tokio::select! {
        _ = cancel.cancelled() => return,
        reply = rpc => reply,
    };
    slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

    let result = match rpc_reply {
        Ok(Ok(Ok(output))) => {
            if output.vote_granted {
                RequestVoteResult::VoteGranted
            } else {
                RequestVoteResult::VoteNotGranted
            }
        }
        Ok(Ok(Err(RequestVoteError::RequestTermOutOfDate(info)))) => RequestVoteResult::StaleTerm {
            new_term: info.current_term,
        },
        // The peer doesn't know us as a member. Retrying won't change its mind.
        Ok(Ok(Err(RequestVoteError::CandidateNotInCluster))) => RequestVoteResult::VoteNotGranted,
        Ok(Ok(Err(e))) => {
            slog::warn!(logger, "RequestVote server fault: {:?}", e);
            RequestVoteResult::RetryableFailure
        }
        Ok(Err(e)) => {
            slog::debug!(logger, "RequestVote transport failure: {:?}", e);
            RequestVoteResult::RetryableFailure
        }
        Err(_timeout) => RequestVoteResult::RetryableFailure,
    };

    let _ = callback
        .notify_request_vote_reply_from_peer(RequestVoteReplyFromPeer { peer_id, term, result })
        .await;
}

pub(super) async fn call_peer_append_entries(
    call: PeerCall,
    input: AppendEntriesInput,
    descriptor: ReplicationReplyFromPeerDescriptor,
) {
    let PeerCall {
        logger,
        client,
        callback,
        rpc_timeout,
        cancel,
    } = call;

    slog::debug!(
        logger,
        "ClientWire - AppendEntries {:?} prev={:?} commit={:?}",
        descriptor.payload,
        input.leader_previous_log_entry,
        input.leader_commit_index
    );
    let rpc_reply = tokio::select! {
        _ = cancel.cancelled() => return,
        reply = tokio::time::timeout(rpc_timeout, client.append_entries(input)) => reply,
    };
    slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

    let reply = ReplicationReplyFromPeer {
        descriptor,
        result: convert_append_entries_reply(rpc_reply),
    };
    let _ = callback.notify_replication_reply_from_peer(reply).await;
}

pub(super) async fn call_peer_install_snapshot(
    call: PeerCall,
    input: InstallSnapshotInput,
    descriptor: ReplicationReplyFromPeerDescriptor,
) {
    let PeerCall {
        logger,
        client,
        callback,
        rpc_timeout,
        cancel,
    } = call;

    slog::debug!(
        logger,
        "ClientWire - InstallSnapshot through {:?} ({} bytes)",
        input.last_included_index,
        input.data.len()
    );
    let rpc_reply = tokio::select! {
        _ = cancel.cancelled() => return,
        reply = tokio::time::timeout(rpc_timeout, client.install_snapshot(input)) => reply,
    };
    slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

    let reply = ReplicationReplyFromPeer {
        descriptor,
        result: convert_install_snapshot_reply(rpc_reply),
    };
    let _ = callback.notify_replication_reply_from_peer(reply).await;
}

fn convert_append_entries_reply<O>(
    rpc_reply: Result<Result<Result<O, AppendEntriesError>, TransportError>, Elapsed>,
) -> Result<(), ReplicationReplyFromPeerError> {
    match rpc_reply {
        Ok(Ok(Ok(_))) => Ok(()),
        Ok(Ok(Err(AppendEntriesError::ClientTermOutOfDate(info)))) => Err(ReplicationReplyFromPeerError::StaleTerm {
            new_term: info.current_term,
        }),
        Ok(Ok(Err(AppendEntriesError::ServerMissingPreviousLogEntry { next_index_hint }))) => {
            Err(ReplicationReplyFromPeerError::PeerMissingPreviousLogEntry { next_index_hint })
        }
        Ok(Ok(Err(e))) => Err(ReplicationReplyFromPeerError::RetryableFailure(format!(
            "Explicit server fault: {}",
            e
        ))),
        Ok(Err(e)) => Err(ReplicationReplyFromPeerError::RetryableFailure(format!(
            "Transport failure: {}",
            e
        ))),
        Err(_timeout) => Err(ReplicationReplyFromPeerError::RetryableFailure(
            "Timed out calling AppendEntries".into(),
        )),
    }
}

fn convert_install_snapshot_reply<O>(
    rpc_reply: Result<Result<Result<O, InstallSnapshotError>, TransportError>, Elapsed>,
) -> Result<(), ReplicationReplyFromPeerError> {
    match rpc_reply {
        Ok(Ok(Ok(_))) => Ok(()),
        Ok(Ok(Err(InstallSnapshotError::ClientTermOutOfDate(info)))) => {
            Err(ReplicationReplyFromPeerError::StaleTerm {
                new_term: info.current_term,
            })
        }
        Ok(Ok(Err(e))) => Err(ReplicationReplyFromPeerError::RetryableFailure(format!(
            "Explicit server fault: {}",
            e
        ))),
        Ok(Err(e)) => Err(ReplicationReplyFromPeerError::RetryableFailure(format!(
            "Transport failure: {}",
            e
        ))),
        Err(_timeout) => Err(ReplicationReplyFromPeerError::RetryableFailure(
            "Timed out calling InstallSnapshot".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::Index;
    use crate::replica::replica_api::{AppendEntriesOutput, TermOutOfDateInfo};

    #[test]
    fn append_entries_reply_conversion() {
        let ok: Result<Result<Result<AppendEntriesOutput, AppendEntriesError>, TransportError>, Elapsed> =
            Ok(Ok(Ok(AppendEntriesOutput {})));
        assert!(convert_append_entries_reply(ok).is_ok());

        let stale = Ok(Ok(Err::<AppendEntriesOutput, _>(AppendEntriesError::ClientTermOutOfDate(
            TermOutOfDateInfo {
                current_term: Term::new(7),
            },
        ))));
        assert!(matches!(
            convert_append_entries_reply(stale),
            Err(ReplicationReplyFromPeerError::StaleTerm { new_term }) if new_term == Term::new(7)
        ));

        let behind = Ok(Ok(Err::<AppendEntriesOutput, _>(
            AppendEntriesError::ServerMissingPreviousLogEntry {
                next_index_hint: Index::new(3),
            },
        )));
        assert!(matches!(
            convert_append_entries_reply(behind),
            Err(ReplicationReplyFromPeerError::PeerMissingPreviousLogEntry { next_index_hint }) if next_index_hint == Index::new(3)
        ));

        let dropped = Ok(Err::<Result<AppendEntriesOutput, AppendEntriesError>, _>(TransportError::Dropped));
        assert!(matches!(
            convert_append_entries_reply(dropped),
            Err(ReplicationReplyFromPeerError::RetryableFailure(_))
        ));
    }
}
