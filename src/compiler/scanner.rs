//! Lexical `require(...)` extraction.
//!
//! The scanner doesn't parse anything. It looks for the exact byte sequence
//! `require(` immediately followed by a quote, and takes everything up to the
//! matching closing quote as an import specifier. There is no notion of
//! comments, strings or template literals, so the text `// require('x')`
//! inside a comment is an import just like real code. Escapes inside the
//! literal are not interpreted either.
//!
//! Every recognized character is ASCII, so scanning raw bytes gives the same
//! result as scanning UTF-8 characters.

use std::collections::HashSet;
use std::fs;
use std::ops::Range;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::warn;

use crate::resolve::Resolver;

const REQUIRE: &[u8] = b"require(";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Outside,
    /// The last `n` bytes spell the first `n` bytes of `require(`.
    Matching(usize),
    /// `require(` was just read, only a quote may follow.
    AwaitingQuote,
    InLiteral { quote: u8, start: usize },
}

impl State {
    /// Advances the recognizer by one byte, returning the span of a literal
    /// closed by this byte.
    fn step(self, pos: usize, byte: u8) -> (State, Option<Range<usize>>) {
        match self {
            State::Outside if byte == REQUIRE[0] => (State::Matching(1), None),
            State::Outside => (State::Outside, None),
            State::Matching(n) if REQUIRE[n] == byte => {
                if n + 1 == REQUIRE.len() {
                    (State::AwaitingQuote, None)
                } else {
                    (State::Matching(n + 1), None)
                }
            }
            State::Matching(n) => (restart(n, byte), None),
            State::AwaitingQuote if byte == b'\'' || byte == b'"' => (
                State::InLiteral {
                    quote: byte,
                    start: pos + 1,
                },
                None,
            ),
            State::AwaitingQuote => (restart(REQUIRE.len(), byte), None),
            State::InLiteral { quote, start } if byte == quote => (State::Outside, Some(start..pos)),
            state @ State::InLiteral { .. } => (state, None),
        }
    }
}

/// State after `byte` broke a match of `matched` bytes: the longest prefix
/// of `require(` that is still a suffix of the input read so far.
fn restart(matched: usize, byte: u8) -> State {
    let k = (1..=matched)
        .rev()
        .find(|&k| REQUIRE[k - 1] == byte && REQUIRE[..k - 1] == REQUIRE[matched + 1 - k..matched])
        .unwrap_or(0);

    match k {
        0 => State::Outside,
        k => State::Matching(k),
    }
}

/// A single import literal found in a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    /// The raw specifier, exactly as written between the quotes.
    pub specifier: String,
    /// Byte range of the specifier, quotes excluded.
    pub span: Range<usize>,
}

/// Iterator over the imports of a buffer, in order of occurrence.
pub struct Imports<'a> {
    source: &'a [u8],
    pos: usize,
    state: State,
}

impl<'a> Imports<'a> {
    pub fn new(source: &'a [u8]) -> Self {
        Self {
            source,
            pos: 0,
            state: State::Outside,
        }
    }
}

impl Iterator for Imports<'_> {
    type Item = Import;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(&byte) = self.source.get(self.pos) {
            let (state, closed) = self.state.step(self.pos, byte);
            self.state = state;
            self.pos += 1;

            if let Some(span) = closed {
                let specifier = String::from_utf8_lossy(&self.source[span.clone()]).into_owned();
                return Some(Import { specifier, span });
            }
        }

        // An unterminated literal at the end of the input is not an import.
        None
    }
}

/// Lists every import specifier in `source`, in order of occurrence.
pub fn scan(source: &[u8]) -> Vec<Import> {
    Imports::new(source).collect()
}

/// The output of [`rewrite`].
#[derive(Debug)]
pub struct Rewritten {
    pub source: Vec<u8>,
    /// Replacement texts, de-duplicated, in order of first occurrence.
    pub imports: Vec<String>,
}

/// Replaces every import specifier with the text returned by `resolve`.
///
/// A specifier for which `resolve` returns `None` is left as is and isn't
/// recorded. Every byte outside of the specifiers is copied unchanged.
pub fn rewrite<F>(source: &[u8], mut resolve: F) -> Rewritten
where
    F: FnMut(&str) -> Option<String>,
{
    let mut output = Vec::with_capacity(source.len());
    let mut imports = Vec::new();
    let mut seen = HashSet::new();
    let mut copied = 0;

    for Import { specifier, span } in Imports::new(source) {
        output.extend_from_slice(&source[copied..span.start]);

        match resolve(&specifier) {
            Some(resolved) => {
                output.extend_from_slice(resolved.as_bytes());
                if seen.insert(resolved.clone()) {
                    imports.push(resolved);
                }
            }
            None => output.extend_from_slice(&source[span.clone()]),
        }

        copied = span.end;
    }

    output.extend_from_slice(&source[copied..]);

    Rewritten {
        source: output,
        imports,
    }
}

/// Rewrites the imports of a compiled file in place and returns the resolved
/// targets.
///
/// Specifiers are resolved from `base`, the root-relative directory of the
/// original source file. A specifier that can't be resolved is logged and
/// left untouched: the file still compiles, and the broken `require` only
/// fails if it's reached at runtime.
pub fn rewrite_file(
    file: &Utf8Path,
    base: &Utf8Path,
    resolver: &Resolver,
) -> std::io::Result<Vec<Utf8PathBuf>> {
    let source = fs::read(file)?;

    let Rewritten { source: output, imports } = rewrite(&source, |specifier| {
        match resolver.resolve(base, specifier) {
            Ok(path) => Some(path.into_string()),
            Err(err) => {
                warn!(%file, "failed to resolve import, leaving it as is: {err}");
                None
            }
        }
    });

    if output != source {
        fs::write(file, &output)?;
    }

    Ok(imports.into_iter().map(Utf8PathBuf::from).collect())
}
