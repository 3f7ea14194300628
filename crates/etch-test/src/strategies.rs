//! Proptest strategies for template text.
use proptest::prelude::*;

/// Text that contains no tag punctuation for any delimiter set produced by
/// [`arb_delimiters`].
pub fn arb_plain_text() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z0-9 ,.!\n\r\t\"'\\\\-]{0,64}").unwrap()
}

/// A delimiter set `(open, inner, close)`.
pub fn arb_delimiters() -> impl Strategy<Value = (String, String, String)> {
    (
        prop::sample::select(vec!["<", "[", "{", "("]),
        prop::sample::select(vec!["%", "$", "?", "@"]),
        prop::sample::select(vec![">", "]", "}", ")"]),
    )
        .prop_map(|(open, inner, close)| (open.to_string(), inner.to_string(), close.to_string()))
}

/// A non-empty list of short words usable as string literals in template code.
pub fn arb_words() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(prop::string::string_regex("[a-z]{1,8}").unwrap(), 1..8)
}

/// Text that the default escape function has to encode.
pub fn arb_markup() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z<>&\"' ]{0,32}").unwrap()
}
