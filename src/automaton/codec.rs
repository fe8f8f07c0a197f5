use crate::automaton::HandlerError;

pub fn encode_message<M: prost::Message>(message: &M) -> Vec<u8> {
    let mut buf = Vec::with_capacity(message.encoded_len());
    message
        .encode(&mut buf)
        .expect("Vec<u8> grows to fit any message");
    buf
}

pub fn decode_payload<M: prost::Message + Default>(
    mutation_type: &str,
    payload: &[u8],
) -> Result<M, HandlerError> {
    M::decode(payload).map_err(|e| HandlerError::MalformedPayload {
        mutation_type: mutation_type.to_string(),
        reason: e.to_string(),
    })
}
