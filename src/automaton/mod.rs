mod codec;
mod composite;
mod part;

pub use codec::decode_payload;
pub use codec::encode_message;
pub use composite::CompositeAutomaton;
pub use composite::RegistrationError;
pub use part::AutomatonPart;
pub use part::HandlerError;
pub use part::MutationContext;
pub use part::MutationError;
pub use part::MALFORMED_MUTATION;

#[cfg(test)]
pub(crate) use composite::test_util;
