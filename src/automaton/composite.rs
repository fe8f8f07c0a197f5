use crate::automaton::codec;
use crate::automaton::{AutomatonPart, HandlerError, MutationContext};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("Part {0} is already registered")]
    DuplicatePart(&'static str),
    #[error("Type {0} already has a handler")]
    DuplicateHandler(&'static str),
}

#[derive(Clone, PartialEq, prost::Message)]
struct ProtoAutomatonSnapshot {
    #[prost(message, repeated, tag = "1")]
    parts: Vec<ProtoPartSnapshot>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct ProtoPartSnapshot {
    #[prost(string, tag = "1")]
    name: String,
    #[prost(bytes, tag = "2")]
    state: Vec<u8>,
}

/// The replicated state machine: a set of parts and the dispatch tables from mutation, transient
/// and query types to the part owning them.
pub struct CompositeAutomaton {
    parts: Vec<Box<dyn AutomatonPart>>,
    mutation_handlers: HashMap<&'static str, usize>,
    transient_handlers: HashMap<&'static str, usize>,
    query_handlers: HashMap<&'static str, usize>,
}

impl CompositeAutomaton {
    pub fn new() -> Self {
        CompositeAutomaton {
            parts: Vec::new(),
            mutation_handlers: HashMap::new(),
            transient_handlers: HashMap::new(),
            query_handlers: HashMap::new(),
        }
    }

    pub fn register_part(&mut self, part: Box<dyn AutomatonPart>) -> Result<(), RegistrationError> {
        if self.parts.iter().any(|p| p.name() == part.name()) {
            return Err(RegistrationError::DuplicatePart(part.name()));
        }

        let slot = self.parts.len();
        let tables = vec![
            (&mut self.mutation_handlers, part.mutation_types()),
            (&mut self.transient_handlers, part.transient_types()),
            (&mut self.query_handlers, part.query_types()),
        ];
        // Validate every table before touching any of them.
        for (table, types) in tables.iter() {
            if let Some(dup) = types.iter().find(|t| table.contains_key(*t)) {
                return Err(RegistrationError::DuplicateHandler(*dup));
            }
        }
        for (table, types) in tables {
            for t in types {
                table.insert(t, slot);
            }
        }

        self.parts.push(part);
        Ok(())
    }

    pub fn handles_mutation(&self, mutation_type: &str) -> bool {
        self.mutation_handlers.contains_key(mutation_type)
    }

    pub fn validate_mutation(&self, mutation_type: &str, payload: &[u8]) -> Result<(), HandlerError> {
        let slot = lookup(&self.mutation_handlers, mutation_type)?;
        self.parts[slot].validate_mutation(mutation_type, payload)
    }

    pub fn apply_mutation(
        &mut self,
        context: &MutationContext,
        mutation_type: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, HandlerError> {
        let slot = lookup(&self.mutation_handlers, mutation_type)?;
        self.parts[slot].apply_mutation(context, mutation_type, payload)
    }

    pub fn execute_transient(
        &mut self,
        timestamp: u64,
        mutation_type: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, HandlerError> {
        let slot = lookup(&self.transient_handlers, mutation_type)?;
        self.parts[slot].execute_transient(timestamp, mutation_type, payload)
    }

    pub fn query(&self, query_type: &str, payload: &[u8]) -> Result<Vec<u8>, HandlerError> {
        let slot = lookup(&self.query_handlers, query_type)?;
        self.parts[slot].query(query_type, payload)
    }

    /// Serializes every part in registration order. Equal states serialize to equal bytes.
    pub fn save_snapshot(&self) -> Vec<u8> {
        let snapshot = ProtoAutomatonSnapshot {
            parts: self
                .parts
                .iter()
                .map(|part| ProtoPartSnapshot {
                    name: part.name().to_string(),
                    state: part.save_snapshot(),
                })
                .collect(),
        };
        codec::encode_message(&snapshot)
    }

    /// Replaces all state with the snapshot's. Parts missing from the snapshot end up cleared.
    pub fn load_snapshot(&mut self, state: &[u8]) -> Result<(), HandlerError> {
        let snapshot: ProtoAutomatonSnapshot =
            prost::Message::decode(state).map_err(|e: prost::DecodeError| {
                HandlerError::CorruptSnapshot {
                    part: "<automaton>".to_string(),
                    reason: e.to_string(),
                }
            })?;

        self.clear();
        for part_snapshot in snapshot.parts {
            let part = self
                .parts
                .iter_mut()
                .find(|p| p.name() == part_snapshot.name)
                .ok_or_else(|| HandlerError::CorruptSnapshot {
                    part: part_snapshot.name.clone(),
                    reason: "no such part is registered".to_string(),
                })?;
            part.load_snapshot(&part_snapshot.state)?;
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        for part in self.parts.iter_mut() {
            part.clear();
        }
    }

    pub fn on_stop_leading(&mut self) {
        for part in self.parts.iter_mut() {
            part.on_stop_leading();
        }
    }

    /// crc32 of the serialized state; replicas holding equal state report equal hashes.
    pub fn state_hash(&self) -> u32 {
        crc32fast::hash(&self.save_snapshot())
    }
}

fn lookup(table: &HashMap<&'static str, usize>, t: &str) -> Result<usize, HandlerError> {
    table
        .get(t)
        .copied()
        .ok_or_else(|| HandlerError::UnknownMutationType(t.to_string()))
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use crate::automaton::MutationError;

    pub(crate) const APPEND: &str = "test.append";
    pub(crate) const REJECT: &str = "test.reject";
    pub(crate) const ECHO: &str = "test.echo";
    pub(crate) const LEN: &str = "test.len";
    /// Appends a little-endian u64. The leader checks the payload length before logging.
    pub(crate) const PUSH_U64: &str = "test.push_u64";
    /// Like [`PUSH_U64`], but the length is only checked when the entry is applied.
    pub(crate) const PUSH_U64_UNCHECKED: &str = "test.push_u64_unchecked";

    fn decode_u64(mutation_type: &str, payload: &[u8]) -> Result<u64, HandlerError> {
        let mut raw = [0u8; 8];
        if payload.len() != raw.len() {
            return Err(HandlerError::MalformedPayload {
                mutation_type: mutation_type.to_string(),
                reason: format!("expected 8 bytes, got {}", payload.len()),
            });
        }
        raw.copy_from_slice(payload);
        Ok(u64::from_le_bytes(raw))
    }

    /// Appends payloads to a list. The response to an append is the new list length.
    #[derive(Default)]
    pub(crate) struct ListPart {
        pub(crate) items: Vec<Vec<u8>>,
        pub(crate) last_timestamp: u64,
    }

    impl AutomatonPart for ListPart {
        fn name(&self) -> &'static str {
            "test.list"
        }

        fn mutation_types(&self) -> Vec<&'static str> {
            vec![APPEND, REJECT, PUSH_U64, PUSH_U64_UNCHECKED]
        }

        fn validate_mutation(&self, mutation_type: &str, payload: &[u8]) -> Result<(), HandlerError> {
            match mutation_type {
                PUSH_U64 => decode_u64(mutation_type, payload).map(drop),
                _ => Ok(()),
            }
        }

        fn transient_types(&self) -> Vec<&'static str> {
            vec![ECHO]
        }

        fn query_types(&self) -> Vec<&'static str> {
            vec![LEN]
        }

        fn apply_mutation(
            &mut self,
            context: &MutationContext,
            mutation_type: &str,
            payload: &[u8],
        ) -> Result<Vec<u8>, HandlerError> {
            match mutation_type {
                APPEND => {
                    self.items.push(payload.to_vec());
                    self.last_timestamp = context.timestamp;
                    Ok((self.items.len() as u64).to_le_bytes().to_vec())
                }
                REJECT => Err(MutationError::new(7, "rejected on purpose").into()),
                PUSH_U64 | PUSH_U64_UNCHECKED => {
                    let value = decode_u64(mutation_type, payload)?;
                    self.items.push(value.to_le_bytes().to_vec());
                    self.last_timestamp = context.timestamp;
                    Ok((self.items.len() as u64).to_le_bytes().to_vec())
                }
                other => Err(HandlerError::UnknownMutationType(other.to_string())),
            }
        }

        fn execute_transient(
            &mut self,
            _timestamp: u64,
            _mutation_type: &str,
            payload: &[u8],
        ) -> Result<Vec<u8>, HandlerError> {
            Ok(payload.to_vec())
        }

        fn query(&self, _query_type: &str, _payload: &[u8]) -> Result<Vec<u8>, HandlerError> {
            Ok((self.items.len() as u64).to_le_bytes().to_vec())
        }

        fn save_snapshot(&self) -> Vec<u8> {
            let mut buf = Vec::new();
            for item in self.items.iter() {
                buf.extend_from_slice(&(item.len() as u32).to_le_bytes());
                buf.extend_from_slice(item);
            }
            buf
        }

        fn load_snapshot(&mut self, mut state: &[u8]) -> Result<(), HandlerError> {
            while !state.is_empty() {
                if state.len() < 4 {
                    return Err(HandlerError::CorruptSnapshot {
                        part: self.name().to_string(),
                        reason: "short length".to_string(),
                    });
                }
                let mut len = [0u8; 4];
                len.copy_from_slice(&state[..4]);
                let len = u32::from_le_bytes(len) as usize;
                state = &state[4..];
                if state.len() < len {
                    return Err(HandlerError::CorruptSnapshot {
                        part: self.name().to_string(),
                        reason: "short item".to_string(),
                    });
                }
                self.items.push(state[..len].to_vec());
                state = &state[len..];
            }
            Ok(())
        }

        fn clear(&mut self) {
            self.items.clear();
            self.last_timestamp = 0;
        }
    }

    pub(crate) fn list_automaton() -> CompositeAutomaton {
        let mut automaton = CompositeAutomaton::new();
        automaton
            .register_part(Box::new(ListPart::default()))
            .unwrap();
        automaton
    }

    pub(crate) fn context(sequence_number: u64) -> MutationContext {
        MutationContext {
            sequence_number,
            term: 1,
            timestamp: 1000 + sequence_number,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;

    #[test]
    fn dispatches_by_type() {
        let mut automaton = list_automaton();
        let response = automaton.apply_mutation(&context(1), APPEND, b"a").unwrap();
        assert_eq!(response, 1u64.to_le_bytes().to_vec());
        assert_eq!(automaton.query(LEN, &[]).unwrap(), 1u64.to_le_bytes().to_vec());
        assert_eq!(automaton.execute_transient(5, ECHO, b"x").unwrap(), b"x".to_vec());

        match automaton.apply_mutation(&context(2), REJECT, &[]) {
            Err(HandlerError::Rejected(e)) => assert_eq!(e.code, 7),
            other => panic!("Unexpected: {:?}", other),
        }
        let unknown = automaton.apply_mutation(&context(3), "nobody.owns.this", &[]);
        assert!(matches!(unknown, Err(ref e) if e.is_fatal()));
        // Mutation types are not queries.
        assert!(automaton.query(APPEND, &[]).is_err());
    }

    #[test]
    fn duplicate_registration_is_refused() {
        let mut automaton = list_automaton();
        assert!(matches!(
            automaton.register_part(Box::new(ListPart::default())),
            Err(RegistrationError::DuplicatePart("test.list"))
        ));
    }

    #[test]
    fn replay_is_deterministic_and_snapshot_equivalent() {
        let payloads: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i; (i % 5) as usize]).collect();

        let mut a = list_automaton();
        let mut b = list_automaton();
        for (i, p) in payloads.iter().enumerate() {
            a.apply_mutation(&context(i as u64 + 1), APPEND, p).unwrap();
            b.apply_mutation(&context(i as u64 + 1), APPEND, p).unwrap();
        }
        assert_eq!(a.save_snapshot(), b.save_snapshot());

        // Snapshot at 10, replay the tail, compare with a full replay.
        let mut c = list_automaton();
        for (i, p) in payloads[..10].iter().enumerate() {
            c.apply_mutation(&context(i as u64 + 1), APPEND, p).unwrap();
        }
        let snapshot = c.save_snapshot();

        let mut d = list_automaton();
        d.apply_mutation(&context(1), APPEND, b"garbage that load must clear")
            .unwrap();
        d.load_snapshot(&snapshot).unwrap();
        for (i, p) in payloads[10..].iter().enumerate() {
            d.apply_mutation(&context(i as u64 + 11), APPEND, p).unwrap();
        }
        assert_eq!(d.state_hash(), a.state_hash());
    }

    #[test]
    fn corrupt_snapshot_is_fatal() {
        let mut automaton = list_automaton();
        let err = automaton.load_snapshot(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn malformed_payloads_fail_validation_and_are_not_fatal() {
        let mut automaton = list_automaton();
        assert!(automaton.validate_mutation(PUSH_U64, &[1, 2, 3]).is_err());
        assert!(automaton.validate_mutation(PUSH_U64, &5u64.to_le_bytes()).is_ok());
        // Types without static checks pass validation whatever the payload.
        assert!(automaton.validate_mutation(PUSH_U64_UNCHECKED, &[1, 2, 3]).is_ok());
        assert!(matches!(
            automaton.validate_mutation("nobody.owns.this", &[]),
            Err(HandlerError::UnknownMutationType(_))
        ));

        let before = automaton.state_hash();
        let err = automaton
            .apply_mutation(&context(1), PUSH_U64_UNCHECKED, &[1, 2, 3])
            .unwrap_err();
        assert!(matches!(err, HandlerError::MalformedPayload { .. }));
        assert!(!err.is_fatal());
        assert_eq!(automaton.state_hash(), before);
    }
}
