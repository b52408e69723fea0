use proc_macro2::{Span, TokenStream};
use quote::{quote, quote_spanned};
use syn::parse::Parser;
use syn::spanned::Spanned;
use syn::{ItemFn, ReturnType};

use crate::parse::*;

// syn::AttributeArgs does not implement syn::Parse
type AttributeArgs = syn::punctuated::Punctuated<syn::Meta, syn::Token![,]>;

/// Tests get a single worker unless asked otherwise, `main` uses the builder
/// default of one worker per CPU.
const DEFAULT_TEST_WORKER_THREADS: usize = 1;

pub(crate) fn main(args: TokenStream, item: TokenStream) -> TokenStream {
    // On failure still expand to something close to the input so IDE
    // completions keep working.
    let input: ItemFn = match syn::parse2(item.clone()) {
        Ok(it) => it,
        Err(e) => return token_stream_with_error(item, e),
    };

    let config = if input.sig.ident == "main" && !input.sig.inputs.is_empty() {
        let msg = "the main function cannot accept arguments";
        Err(syn::Error::new_spanned(&input.sig.ident, msg))
    } else {
        AttributeArgs::parse_terminated
            .parse2(args)
            .and_then(|args| build_config(&input, args, false))
    };

    match config {
        Ok(config) => expand(input, false, config),
        Err(e) => token_stream_with_error(expand(input, false, FinalConfig::default()), e),
    }
}

pub(crate) fn test(args: TokenStream, item: TokenStream) -> TokenStream {
    let input: ItemFn = match syn::parse2(item.clone()) {
        Ok(it) => it,
        Err(e) => return token_stream_with_error(item, e),
    };

    let config = if let Some(attr) = input.attrs.iter().find(|attr| is_test_attribute(attr)) {
        let msg = "second test attribute is supplied, consider removing or changing the order of your test attributes";
        Err(syn::Error::new_spanned(attr, msg))
    } else if !input.sig.inputs.is_empty() {
        let msg = "test functions cannot accept arguments";
        Err(syn::Error::new_spanned(&input.sig.inputs, msg))
    } else {
        AttributeArgs::parse_terminated
            .parse2(args)
            .and_then(|args| build_config(&input, args, true))
    };

    match config {
        Ok(config) => expand(input, true, config),
        Err(e) => token_stream_with_error(expand(input, true, FinalConfig::default()), e),
    }
}

#[derive(Default)]
struct FinalConfig {
    worker_threads: Option<usize>,
    name: Option<String>,
}

struct ConfigBuilder {
    worker_threads: Option<usize>,
    name: Option<String>,
    is_test: bool,
}

impl ConfigBuilder {
    fn new(is_test: bool) -> Self {
        ConfigBuilder {
            worker_threads: None,
            name: None,
            is_test,
        }
    }

    fn macro_name(&self) -> &'static str {
        if self.is_test {
            "spindle::test"
        } else {
            "spindle::main"
        }
    }

    fn set_worker_threads(&mut self, lit: &syn::Lit, span: Span) -> syn::Result<()> {
        if self.worker_threads.is_some() {
            return Err(syn::Error::new(
                span,
                "`worker_threads` set multiple times.",
            ));
        }

        let worker_threads = parse_int(lit, span, "worker_threads")?;
        if worker_threads == 0 {
            return Err(syn::Error::new(span, "`worker_threads` may not be 0."));
        }
        self.worker_threads = Some(worker_threads);
        Ok(())
    }

    fn set_name(&mut self, lit: &syn::Lit, span: Span) -> syn::Result<()> {
        if self.name.is_some() {
            return Err(syn::Error::new(span, "`name` set multiple times."));
        }

        let name = parse_string(lit, span, "name")?;
        if name.is_empty() {
            return Err(syn::Error::new(span, "`name` may not be empty."));
        }
        self.name = Some(name);
        Ok(())
    }

    fn build(self) -> FinalConfig {
        let worker_threads = match (self.worker_threads, self.is_test) {
            (Some(n), _) => Some(n),
            (None, true) => Some(DEFAULT_TEST_WORKER_THREADS),
            (None, false) => None,
        };

        FinalConfig {
            worker_threads,
            name: self.name,
        }
    }
}

fn build_config(input: &ItemFn, args: AttributeArgs, is_test: bool) -> syn::Result<FinalConfig> {
    let mut config = ConfigBuilder::new(is_test);
    let macro_name = config.macro_name();

    if let Some(asyncness) = input.sig.asyncness {
        let msg = format!(
            "`#[{macro_name}]` runs a synchronous body on a coroutine, remove the `async` keyword"
        );
        return Err(syn::Error::new_spanned(asyncness, msg));
    }

    for arg in args {
        match arg {
            syn::Meta::NameValue(namevalue) => {
                let ident = namevalue
                    .path
                    .get_ident()
                    .ok_or_else(|| {
                        syn::Error::new_spanned(&namevalue, "Must have specified ident")
                    })?
                    .to_string()
                    .to_lowercase();
                let lit = match &namevalue.value {
                    syn::Expr::Lit(syn::ExprLit { lit, .. }) => lit,
                    expr => return Err(syn::Error::new_spanned(expr, "Must be a literal")),
                };
                match ident.as_str() {
                    "worker_threads" => config.set_worker_threads(lit, lit.span())?,
                    "name" => config.set_name(lit, lit.span())?,
                    name => {
                        let msg = format!(
                            "Unknown attribute {name} is specified; expected one of: `worker_threads`, `name`",
                        );
                        return Err(syn::Error::new_spanned(namevalue, msg));
                    }
                }
            }
            syn::Meta::Path(path) => {
                let name = path
                    .get_ident()
                    .ok_or_else(|| syn::Error::new_spanned(&path, "Must have specified ident"))?
                    .to_string()
                    .to_lowercase();
                let msg = match name.as_str() {
                    "worker_threads" | "name" => {
                        format!("The `{name}` attribute requires an argument.")
                    }
                    "flavor" | "multi_thread" | "current_thread" => format!(
                        "`#[{macro_name}]` has a single processor flavor, set `worker_threads` instead."
                    ),
                    name => format!(
                        "Unknown attribute {name} is specified; expected one of: `worker_threads`, `name`."
                    ),
                };
                return Err(syn::Error::new_spanned(path, msg));
            }
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "Unknown attribute inside the macro",
                ));
            }
        }
    }

    Ok(config.build())
}

/// Rewrites
///
/// ```ignore
/// #[spindle::test(worker_threads = 2)]
/// fn my_test() -> anyhow::Result<()> { body }
/// ```
///
/// into a plain `#[test]` that builds a processor and blocks on the body,
/// run as a task.
fn expand(input: ItemFn, is_test: bool, config: FinalConfig) -> TokenStream {
    let ItemFn {
        mut attrs,
        vis,
        mut sig,
        block,
    } = input;
    sig.asyncness = None;

    // Type mismatches get reported on the last statement of the body.
    let last_stmt_span = block
        .stmts
        .last()
        .map_or_else(Span::call_site, |stmt| stmt.span());

    let mut processor = quote_spanned! {last_stmt_span=>
        ::spindle::runtime::Builder::new()
    };
    if let Some(name) = config.name {
        processor = quote_spanned! {last_stmt_span=> #processor.name(#name) };
    }
    if let Some(n) = config.worker_threads {
        processor = quote_spanned! {last_stmt_span=> #processor.worker_threads(#n) };
    }

    let output = match &sig.output {
        ReturnType::Default => quote! {},
        ReturnType::Type(arrow, ty) => quote! { #arrow #ty },
    };

    if is_test {
        attrs.push(syn::parse_quote! { #[::core::prelude::v1::test] });
    }

    quote! {
        #(#attrs)*
        #vis #sig {
            let body = move || #output #block;

            #[allow(clippy::expect_used, clippy::needless_return)]
            {
                return #processor
                    .try_build()
                    .expect("Failed building the task processor")
                    .block_on(body);
            }
        }
    }
}
