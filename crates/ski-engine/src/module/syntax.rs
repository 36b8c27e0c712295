//! ES module syntax detection
//!
//! A token-level scan, not a parse: source is an ES module when it has a
//! top-level `import`/`export` statement or a top-level `await`. Strings,
//! template literals and comments are skipped so their contents never count.

use logos::Logos;

#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
#[logos(skip r"[ \t\r\f]+")]
#[logos(skip r"//[^\n]*")]
#[logos(skip r"/\*([^*]|\*+[^*/])*\*+/")]
enum Token {
    #[token("import")]
    Import,

    #[token("export")]
    Export,

    #[token("await")]
    Await,

    #[regex(r"[A-Za-z_$][A-Za-z0-9_$]*")]
    Ident,

    #[regex(r#""([^"\\\n]|\\.)*""#)]
    #[regex(r"'([^'\\\n]|\\.)*'")]
    Str,

    #[regex(r"`([^`\\]|\\.)*`")]
    Template,

    #[token("\n")]
    Newline,

    #[token("{")]
    LBrace,

    #[token("}")]
    RBrace,

    #[token("(")]
    LParen,

    #[token(";")]
    Semi,

    #[token(".")]
    Dot,
}

/// Whether `source` uses ES module syntax
pub fn is_es_module(source: &str) -> bool {
    let mut lexer = Token::lexer(source);
    let mut depth = 0usize;
    let mut at_statement = true;
    let mut previous: Option<Token> = None;

    while let Some(token) = lexer.next() {
        let Ok(token) = token else {
            at_statement = false;
            previous = None;
            continue;
        };

        match token {
            Token::Import if depth == 0 && at_statement => {
                // `import(...)` is a dynamic import, valid in scripts too.
                let next = lexer.clone().flatten().find(|t| *t != Token::Newline);
                if next != Some(Token::LParen) {
                    return true;
                }
            }
            Token::Export if depth == 0 && at_statement => return true,
            Token::Await if depth == 0 && previous != Some(Token::Dot) => return true,
            Token::LBrace => depth += 1,
            Token::RBrace => depth = depth.saturating_sub(1),
            _ => {}
        }

        at_statement = matches!(
            token,
            Token::Newline | Token::Semi | Token::LBrace | Token::RBrace
        );
        if token != Token::Newline {
            previous = Some(token);
        }
    }
    false
}
