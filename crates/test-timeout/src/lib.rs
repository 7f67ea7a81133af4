//! `#[tokio_timeout_test]`: run an async test on a fresh current-thread
//! runtime inside a watchdog thread so a stuck session fails instead of
//! hanging the whole suite.
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test]
//! async fn attaches_once() { /* ... */ }
//!
//! #[test_timeout::tokio_timeout_test(secs = 5, start_paused)]
//! async fn waits_for_handshake_grace() { /* ... */ }
//! ```

use proc_macro::TokenStream;
use quote::quote;
use syn::{Attribute, ItemFn, LitInt, parse_macro_input};

const DEFAULT_SECS: u64 = 30;

struct Options {
    secs: u64,
    start_paused: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            secs: DEFAULT_SECS,
            start_paused: false,
        }
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut options = Options::default();
    let parser = syn::meta::parser(|meta| {
        if meta.path.is_ident("secs") {
            let lit: LitInt = meta.value()?.parse()?;
            options.secs = lit.base10_parse()?;
            if options.secs == 0 {
                return Err(meta.error("secs must be greater than zero"));
            }
            Ok(())
        } else if meta.path.is_ident("start_paused") {
            options.start_paused = true;
            Ok(())
        } else {
            Err(meta.error("expected `secs = N` or `start_paused`"))
        }
    });
    parse_macro_input!(attr with parser);

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.take().is_none() {
        return syn::Error::new_spanned(&sig.fn_token, "expected an async fn")
            .to_compile_error()
            .into();
    }

    let attrs: Vec<Attribute> = attrs.into_iter().filter(|a| !is_plain_test(a)).collect();
    let secs = options.secs;
    let paused = options.start_paused;

    let expanded = quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let limit = ::std::time::Duration::from_secs(#secs);
            let (done_tx, done_rx) = ::std::sync::mpsc::channel();
            ::std::thread::Builder::new()
                .name("tokio-timeout-test".into())
                .spawn(move || {
                    let outcome = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| {
                        let mut builder = ::tokio::runtime::Builder::new_current_thread();
                        builder.enable_all();
                        if #paused {
                            builder.start_paused(true);
                        }
                        let runtime = builder.build().expect("failed to build test runtime");
                        runtime.block_on(async move #block)
                    }));
                    let _ = done_tx.send(outcome);
                })
                .expect("failed to spawn test thread");

            match done_rx.recv_timeout(limit) {
                Ok(Ok(())) => {}
                Ok(Err(panic)) => ::std::panic::resume_unwind(panic),
                Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded {}s", #secs)
                }
                Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting")
                }
            }
        }
    };
    expanded.into()
}

// Drops a stray `#[test]` / `#[tokio::test]` so the expansion does not
// register the function twice.
fn is_plain_test(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
