//! Parser contract and its `parser:<name>` executor module

use crate::context::RunContext;
use crate::host::HostContext;
use rquickjs::{Ctx, Exception, Function, Object, Value};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by a [`Parser`]
#[derive(Debug, Clone, Error)]
pub enum ParserError {
    /// The selector is not valid for this parser
    #[error("invalid selector {selector:?}: {message}")]
    InvalidSelector {
        /// Offending selector
        selector: String,
        /// Parser-specific detail
        message: String,
    },

    /// The content could not be parsed
    #[error("invalid content: {0}")]
    InvalidContent(String),
}

/// Content extraction by selector
pub trait Parser: Send + Sync {
    /// First match rendered as text
    fn get_string(&self, ctx: &RunContext, content: &str, selector: &str)
        -> Result<String, ParserError>;

    /// Every match rendered as text
    fn get_strings(
        &self,
        ctx: &RunContext,
        content: &str,
        selector: &str,
    ) -> Result<Vec<String>, ParserError>;

    /// First matching element, serialized
    fn get_element(
        &self,
        ctx: &RunContext,
        content: &str,
        selector: &str,
    ) -> Result<String, ParserError>;

    /// Every matching element, serialized
    fn get_elements(
        &self,
        ctx: &RunContext,
        content: &str,
        selector: &str,
    ) -> Result<Vec<String>, ParserError>;
}

/// Exports object of a `parser:<name>` module
pub(crate) fn parser_exports<'js>(
    ctx: &Ctx<'js>,
    parser: Arc<dyn Parser>,
    host: &HostContext,
) -> rquickjs::Result<Value<'js>> {
    let exports = Object::new(ctx.clone())?;

    let (p, h) = (parser.clone(), host.clone());
    exports.set(
        "getString",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, content: String, selector: String| {
                p.get_string(&h.run_context(), &content, &selector)
                    .map_err(|err| throw(&ctx, err))
            },
        )?,
    )?;

    let (p, h) = (parser.clone(), host.clone());
    exports.set(
        "getStrings",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, content: String, selector: String| {
                p.get_strings(&h.run_context(), &content, &selector)
                    .map_err(|err| throw(&ctx, err))
            },
        )?,
    )?;

    let (p, h) = (parser.clone(), host.clone());
    exports.set(
        "getElement",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, content: String, selector: String| {
                p.get_element(&h.run_context(), &content, &selector)
                    .map_err(|err| throw(&ctx, err))
            },
        )?,
    )?;

    let h = host.clone();
    exports.set(
        "getElements",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, content: String, selector: String| {
                parser
                    .get_elements(&h.run_context(), &content, &selector)
                    .map_err(|err| throw(&ctx, err))
            },
        )?,
    )?;

    Ok(exports.into_value())
}

fn throw(ctx: &Ctx<'_>, err: ParserError) -> rquickjs::Error {
    Exception::throw_message(ctx, &err.to_string())
}
