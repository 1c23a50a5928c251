//! Parsing of the textual machine-code format.

use pest::Parser;
use pest_derive::Parser;

use crate::object::LoadError;

#[derive(Parser)]
#[grammar = "src/grammar.pest"]
struct ProgramParser;

/// Extract the machine words of a program source, in order.
pub(crate) fn parse_words(src: &str) -> Result<Vec<u32>, LoadError> {
    let main = ProgramParser::parse(Rule::main, src)
        .map_err(|e| LoadError::Syntax(e.to_string()))?
        .next()
        .ok_or_else(|| LoadError::Syntax("empty parse result".to_string()))?;

    let mut words = Vec::new();
    for pair in main.into_inner().filter(|p| p.as_rule() == Rule::word) {
        let text = pair.as_str();
        let digits = text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"))
            .unwrap_or(text);
        let word = u32::from_str_radix(digits, 16).map_err(|_| LoadError::BadWord {
            line: pair.line_col().0,
            text: text.to_string(),
        })?;
        words.push(word);
    }
    Ok(words)
}
