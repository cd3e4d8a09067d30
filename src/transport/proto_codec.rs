//! Conversions between the replica's RPC types and their protobuf form. Shared by the gRPC client
//! and server so that both sides agree on the encoding of "none" (0) and of errors.

use crate::commitlog::Index;
use crate::grpc::{
    proto_append_entries_error, proto_append_entries_result, proto_install_snapshot_error,
    proto_install_snapshot_result, proto_request_vote_error, proto_request_vote_result, ProtoAppendEntriesError,
    ProtoAppendEntriesReq, ProtoAppendEntriesResult, ProtoAppendEntriesSuccess, ProtoClientNotInCluster,
    ProtoClientStaleTerm, ProtoInstallSnapshotError, ProtoInstallSnapshotReq, ProtoInstallSnapshotResult,
    ProtoInstallSnapshotSuccess, ProtoLogEntry, ProtoRequestVoteError, ProtoRequestVoteReq, ProtoRequestVoteResult,
    ProtoRequestVoteSuccess, ProtoServerFault, ProtoServerMissingPreviousLog,
};
use crate::replica::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, EntryKind, InstallSnapshotError,
    InstallSnapshotInput, InstallSnapshotOutput, ReplicaId, ReplicaMetadata, RequestVoteError, RequestVoteInput,
    RequestVoteOutput, Term, TermOutOfDateInfo, WriteAheadLogEntry,
};
use bytes::Bytes;
use std::convert::TryFrom;

#[derive(Debug, thiserror::Error)]
#[error("Malformed message: {0}")]
pub(crate) struct MalformedMessage(pub(crate) String);

// ------- Shared -------

fn encode_log_entry_metadata(metadata: Option<(Term, Index)>) -> (u64, u64) {
    match metadata {
        None => (0, 0),
        Some((term, index)) => (term.as_u64(), index.as_u64()),
    }
}

fn decode_log_entry_metadata(term: u64, index: u64) -> Result<Option<(Term, Index)>, MalformedMessage> {
    match (term, index) {
        (0, 0) => Ok(None),
        (0, _) => Err(MalformedMessage("log entry term 0 with non-0 index".into())),
        (_, 0) => Err(MalformedMessage("log entry index 0 with non-0 term".into())),
        (term, index) => Ok(Some((Term::new(term), Index::new(index)))),
    }
}

fn encode_optional_index(index: Option<Index>) -> u64 {
    index.map(|i| i.as_u64()).unwrap_or(0)
}

fn decode_index(index: u64, field: &str) -> Result<Index, MalformedMessage> {
    Index::from_u64_opt(index).ok_or_else(|| MalformedMessage(format!("{} must be non-0", field)))
}

fn server_fault(message: impl Into<String>) -> ProtoServerFault {
    ProtoServerFault {
        message: message.into(),
    }
}

// ------- RequestVote -------

pub(crate) fn encode_request_vote_input(input: RequestVoteInput) -> ProtoRequestVoteReq {
    let (last_log_entry_term, last_log_entry_index) = encode_log_entry_metadata(input.candidate_last_log_entry);
    ProtoRequestVoteReq {
        client_node_id: input.candidate_id.into_inner(),
        term: input.candidate_term.as_u64(),
        last_log_entry_term,
        last_log_entry_index,
    }
}

pub(crate) fn decode_request_vote_input(rpc_request: ProtoRequestVoteReq) -> Result<RequestVoteInput, MalformedMessage> {
    Ok(RequestVoteInput {
        candidate_term: Term::new(rpc_request.term),
        candidate_id: ReplicaId::new(rpc_request.client_node_id),
        candidate_last_log_entry: decode_log_entry_metadata(
            rpc_request.last_log_entry_term,
            rpc_request.last_log_entry_index,
        )?,
    })
}

pub(crate) fn encode_request_vote_result(
    app_result: Result<RequestVoteOutput, RequestVoteError>,
) -> ProtoRequestVoteResult {
    let result = match app_result {
        Ok(ok) => proto_request_vote_result::Result::Ok(ProtoRequestVoteSuccess {
            vote_granted: ok.vote_granted,
        }),
        Err(e) => {
            let err = match e {
                RequestVoteError::CandidateNotInCluster => {
                    proto_request_vote_error::Err::ClientNotInCluster(ProtoClientNotInCluster {})
                }
                RequestVoteError::RequestTermOutOfDate(info) => {
                    proto_request_vote_error::Err::StaleTerm(ProtoClientStaleTerm {
                        current_term: info.current_term.as_u64(),
                    })
                }
                RequestVoteError::ServerIoError(_) => {
                    proto_request_vote_error::Err::ServerFault(server_fault("Local IO failure"))
                }
                RequestVoteError::ActorExited => proto_request_vote_error::Err::ServerFault(server_fault(
                    "Server internal replica task has exited",
                )),
            };
            proto_request_vote_result::Result::Err(ProtoRequestVoteError { err: Some(err) })
        }
    };

    ProtoRequestVoteResult { result: Some(result) }
}

pub(crate) fn decode_request_vote_result(
    rpc_reply: ProtoRequestVoteResult,
) -> Result<Result<RequestVoteOutput, RequestVoteError>, MalformedMessage> {
    match rpc_reply.result {
        Some(proto_request_vote_result::Result::Ok(ok)) => Ok(Ok(RequestVoteOutput {
            vote_granted: ok.vote_granted,
        })),
        Some(proto_request_vote_result::Result::Err(ProtoRequestVoteError { err: Some(err) })) => match err {
            proto_request_vote_error::Err::ClientNotInCluster(_) => Ok(Err(RequestVoteError::CandidateNotInCluster)),
            proto_request_vote_error::Err::StaleTerm(stale) => Ok(Err(RequestVoteError::RequestTermOutOfDate(
                TermOutOfDateInfo {
                    current_term: Term::new(stale.current_term),
                },
            ))),
            proto_request_vote_error::Err::ServerFault(fault) => Err(MalformedMessage(format!(
                "server fault: {}",
                fault.message
            ))),
        },
        Some(proto_request_vote_result::Result::Err(ProtoRequestVoteError { err: None })) | None => {
            Err(MalformedMessage("empty RequestVote result".into()))
        }
    }
}

// ------- AppendEntries -------

fn encode_log_entry(entry: WriteAheadLogEntry) -> ProtoLogEntry {
    ProtoLogEntry {
        term: entry.term.as_u64(),
        kind: u32::from(entry.kind.code()),
        data: entry.data.to_vec(),
    }
}

fn decode_log_entry(entry: ProtoLogEntry) -> Result<WriteAheadLogEntry, MalformedMessage> {
    let code = u8::try_from(entry.kind).map_err(|_| MalformedMessage(format!("entry kind {}", entry.kind)))?;
    let kind = EntryKind::from_code(code).map_err(|e| MalformedMessage(e.to_string()))?;
    if entry.term == 0 {
        return Err(MalformedMessage("log entry term must be non-0".into()));
    }

    Ok(WriteAheadLogEntry {
        term: Term::new(entry.term),
        kind,
        data: Bytes::from(entry.data),
    })
}

pub(crate) fn encode_append_entries_input(input: AppendEntriesInput) -> ProtoAppendEntriesReq {
    let (previous_log_entry_term, previous_log_entry_index) =
        encode_log_entry_metadata(input.leader_previous_log_entry);
    ProtoAppendEntriesReq {
        client_node_id: input.leader_id.into_inner(),
        term: input.leader_term.as_u64(),
        commit_index: encode_optional_index(input.leader_commit_index),
        previous_log_entry_term,
        previous_log_entry_index,
        new_entries: input.new_entries.into_iter().map(encode_log_entry).collect(),
    }
}

pub(crate) fn decode_append_entries_input(
    rpc_request: ProtoAppendEntriesReq,
) -> Result<AppendEntriesInput, MalformedMessage> {
    let new_entries = rpc_request
        .new_entries
        .into_iter()
        .map(decode_log_entry)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(AppendEntriesInput {
        leader_term: Term::new(rpc_request.term),
        leader_id: ReplicaId::new(rpc_request.client_node_id),
        leader_previous_log_entry: decode_log_entry_metadata(
            rpc_request.previous_log_entry_term,
            rpc_request.previous_log_entry_index,
        )?,
        leader_commit_index: Index::from_u64_opt(rpc_request.commit_index),
        new_entries,
    })
}

pub(crate) fn encode_append_entries_result(
    app_result: Result<AppendEntriesOutput, AppendEntriesError>,
) -> ProtoAppendEntriesResult {
    let result = match app_result {
        Ok(_) => proto_append_entries_result::Result::Ok(ProtoAppendEntriesSuccess {
            // Empty
        }),
        Err(e) => {
            let err = match e {
                AppendEntriesError::ClientTermOutOfDate(info) => {
                    proto_append_entries_error::Err::StaleTerm(ProtoClientStaleTerm {
                        current_term: info.current_term.as_u64(),
                    })
                }
                AppendEntriesError::ServerMissingPreviousLogEntry { next_index_hint } => {
                    proto_append_entries_error::Err::MissingLog(ProtoServerMissingPreviousLog {
                        next_index_hint: next_index_hint.as_u64(),
                    })
                }
                AppendEntriesError::ServerIoError(_) => {
                    proto_append_entries_error::Err::ServerFault(server_fault("Local IO failure"))
                }
                AppendEntriesError::ActorExited => proto_append_entries_error::Err::ServerFault(server_fault(
                    "Server internal replica task has exited",
                )),
            };
            proto_append_entries_result::Result::Err(ProtoAppendEntriesError { err: Some(err) })
        }
    };

    ProtoAppendEntriesResult { result: Some(result) }
}

pub(crate) fn decode_append_entries_result(
    rpc_reply: ProtoAppendEntriesResult,
) -> Result<Result<AppendEntriesOutput, AppendEntriesError>, MalformedMessage> {
    match rpc_reply.result {
        Some(proto_append_entries_result::Result::Ok(_)) => Ok(Ok(AppendEntriesOutput {})),
        Some(proto_append_entries_result::Result::Err(ProtoAppendEntriesError { err: Some(err) })) => match err {
            proto_append_entries_error::Err::StaleTerm(stale) => Ok(Err(AppendEntriesError::ClientTermOutOfDate(
                TermOutOfDateInfo {
                    current_term: Term::new(stale.current_term),
                },
            ))),
            proto_append_entries_error::Err::MissingLog(missing) => {
                Ok(Err(AppendEntriesError::ServerMissingPreviousLogEntry {
                    next_index_hint: decode_index(missing.next_index_hint, "next_index_hint")?,
                }))
            }
            proto_append_entries_error::Err::ServerFault(fault) => Err(MalformedMessage(format!(
                "server fault: {}",
                fault.message
            ))),
        },
        Some(proto_append_entries_result::Result::Err(ProtoAppendEntriesError { err: None })) | None => {
            Err(MalformedMessage("empty AppendEntries result".into()))
        }
    }
}

// ------- InstallSnapshot -------

pub(crate) fn encode_install_snapshot_input(input: InstallSnapshotInput) -> ProtoInstallSnapshotReq {
    ProtoInstallSnapshotReq {
        client_node_id: input.leader_id.into_inner(),
        term: input.leader_term.as_u64(),
        last_included_index: input.last_included_index.as_u64(),
        last_included_term: input.last_included_term.as_u64(),
        members: input.members.iter().map(|md| md.encode().to_vec()).collect(),
        data: input.data.to_vec(),
    }
}

pub(crate) fn decode_install_snapshot_input(
    rpc_request: ProtoInstallSnapshotReq,
) -> Result<InstallSnapshotInput, MalformedMessage> {
    let members = rpc_request
        .members
        .into_iter()
        .map(|bytes| ReplicaMetadata::decode(Bytes::from(bytes)).map_err(|e| MalformedMessage(e.to_string())))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(InstallSnapshotInput {
        leader_term: Term::new(rpc_request.term),
        leader_id: ReplicaId::new(rpc_request.client_node_id),
        last_included_index: decode_index(rpc_request.last_included_index, "last_included_index")?,
        last_included_term: Term::new(rpc_request.last_included_term),
        members,
        data: Bytes::from(rpc_request.data),
    })
}

pub(crate) fn encode_install_snapshot_result(
    app_result: Result<InstallSnapshotOutput, InstallSnapshotError>,
) -> ProtoInstallSnapshotResult {
    let result = match app_result {
        Ok(_) => proto_install_snapshot_result::Result::Ok(ProtoInstallSnapshotSuccess {
            // Empty
        }),
        Err(e) => {
            let err = match e {
                InstallSnapshotError::ClientTermOutOfDate(info) => {
                    proto_install_snapshot_error::Err::StaleTerm(ProtoClientStaleTerm {
                        current_term: info.current_term.as_u64(),
                    })
                }
                other => proto_install_snapshot_error::Err::ServerFault(server_fault(other.to_string())),
            };
            proto_install_snapshot_result::Result::Err(ProtoInstallSnapshotError { err: Some(err) })
        }
    };

    ProtoInstallSnapshotResult { result: Some(result) }
}

pub(crate) fn decode_install_snapshot_result(
    rpc_reply: ProtoInstallSnapshotResult,
) -> Result<Result<InstallSnapshotOutput, InstallSnapshotError>, MalformedMessage> {
    match rpc_reply.result {
        Some(proto_install_snapshot_result::Result::Ok(_)) => Ok(Ok(InstallSnapshotOutput {})),
        Some(proto_install_snapshot_result::Result::Err(ProtoInstallSnapshotError { err: Some(err) })) => match err {
            proto_install_snapshot_error::Err::StaleTerm(stale) => Ok(Err(InstallSnapshotError::ClientTermOutOfDate(
                TermOutOfDateInfo {
                    current_term: Term::new(stale.current_term),
                },
            ))),
            // The peer's state machine or disk failed. It'll be retried like any other fault.
            proto_install_snapshot_error::Err::ServerFault(fault) => {
                Ok(Err(InstallSnapshotError::StateMachineFailure(fault.message)))
            }
        },
        Some(proto_install_snapshot_result::Result::Err(ProtoInstallSnapshotError { err: None })) | None => {
            Err(MalformedMessage("empty InstallSnapshot result".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::ReplicaInfoBlob;
    use std::net::Ipv4Addr;

    #[test]
    fn none_is_encoded_as_zero() {
        let input = AppendEntriesInput {
            leader_term: Term::new(3),
            leader_id: ReplicaId::new("a"),
            leader_previous_log_entry: None,
            leader_commit_index: None,
            new_entries: vec![WriteAheadLogEntry::no_op(Term::new(3))],
        };

        let proto = encode_append_entries_input(input);
        assert_eq!(proto.previous_log_entry_term, 0);
        assert_eq!(proto.previous_log_entry_index, 0);
        assert_eq!(proto.commit_index, 0);

        let decoded = decode_append_entries_input(proto).unwrap();
        assert_eq!(decoded.leader_previous_log_entry, None);
        assert_eq!(decoded.leader_commit_index, None);
        assert_eq!(decoded.new_entries, vec![WriteAheadLogEntry::no_op(Term::new(3))]);
    }

    #[test]
    fn half_specified_previous_entry_is_rejected() {
        let proto = ProtoRequestVoteReq {
            client_node_id: "a".into(),
            term: 2,
            last_log_entry_term: 0,
            last_log_entry_index: 5,
        };
        assert!(decode_request_vote_input(proto).is_err());
    }

    #[test]
    fn unknown_entry_kind_is_rejected() {
        let proto = ProtoAppendEntriesReq {
            client_node_id: "a".into(),
            term: 2,
            commit_index: 0,
            previous_log_entry_term: 0,
            previous_log_entry_index: 0,
            new_entries: vec![ProtoLogEntry {
                term: 2,
                kind: 2,
                data: vec![],
            }],
        };
        assert!(decode_append_entries_input(proto).is_err());
    }

    #[test]
    fn errors_survive_the_wire() {
        let reply = encode_append_entries_result(Err(AppendEntriesError::ServerMissingPreviousLogEntry {
            next_index_hint: Index::new(7),
        }));
        match decode_append_entries_result(reply).unwrap() {
            Err(AppendEntriesError::ServerMissingPreviousLogEntry { next_index_hint }) => {
                assert_eq!(next_index_hint, Index::new(7))
            }
            other => panic!("Unexpected result {:?}", other),
        }

        let reply = encode_request_vote_result(Err(RequestVoteError::CandidateNotInCluster));
        assert!(matches!(
            decode_request_vote_result(reply).unwrap(),
            Err(RequestVoteError::CandidateNotInCluster)
        ));

        let reply = encode_request_vote_result(Err(RequestVoteError::ActorExited));
        assert!(decode_request_vote_result(reply).is_err());
    }

    #[test]
    fn snapshot_members_are_carried() {
        let md = ReplicaMetadata::new(ReplicaId::new("r1"), Ipv4Addr::LOCALHOST, 4001, ReplicaInfoBlob::new(9));
        let input = InstallSnapshotInput {
            leader_term: Term::new(4),
            leader_id: ReplicaId::new("r1"),
            last_included_index: Index::new(12),
            last_included_term: Term::new(3),
            members: vec![md.clone()],
            data: Bytes::from_static(b"state"),
        };

        let decoded = decode_install_snapshot_input(encode_install_snapshot_input(input)).unwrap();
        assert_eq!(decoded.members, vec![md]);
        assert_eq!(decoded.last_included_index, Index::new(12));
        assert_eq!(&decoded.data[..], b"state");
    }
}
