//! MIME parsing and content heuristics for synchronized messages.

pub mod heuristics;
pub mod parser;

pub use heuristics::{HeuristicMatcher, HeuristicRules};
pub use parser::{
    ParseError, ParsedMessage, decode_encoded_words, message_id_from_headers, normalize_message_id,
    parse_message,
};
