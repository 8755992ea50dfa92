use proc_macro::{Span, TokenStream};
use quote::quote;
use syn::{Error, Ident, ItemFn, LitBool, Token, parse::Parse, parse_macro_input};

const DEFAULT_CATCH_INTERRUPT: bool = true;

struct MainAttr {
    catch_interrupt: bool,
}

impl Parse for MainAttr {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        let name: Ident = input.parse()?;
        input.parse::<Token![=]>()?;
        let value: LitBool = input.parse()?;

        if name == "catch_interrupt" {
            Ok(Self {
                catch_interrupt: value.value,
            })
        } else {
            Err(Error::new_spanned(name, "Expected `catch_interrupt` argument"))
        }
    }
}

/// Runs `async fn main` as the root fiber of the main thread's hub.
///
/// An interrupt (SIGINT) ends the process with exit status 130. Pass
/// `catch_interrupt = false` to leave SIGINT alone.
#[proc_macro_attribute]
pub fn main(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut input = parse_macro_input!(item as ItemFn);

    if input.sig.ident != "main" {
        let error = Error::new_spanned(input.sig.ident, "greenhub::main can only be used on 'main'");
        return error.to_compile_error().into();
    }

    if input.sig.asyncness.is_none() {
        let error = Error::new_spanned(input.sig.fn_token, "main must be async");
        return error.to_compile_error().into();
    }

    let catch_interrupt = if attr.is_empty() {
        DEFAULT_CATCH_INTERRUPT
    } else {
        let MainAttr { catch_interrupt } = parse_macro_input!(attr as MainAttr);
        catch_interrupt
    };

    input.sig.ident = Ident::new("main_greenhub", input.sig.ident.span());
    let main_greenhub_fn = Ident::new("main_greenhub", Span::call_site().into());
    let output = &input.sig.output;

    let expanded = quote! {
        #input
        fn main() #output {
            let handle = match ::greenhub::runtime::RuntimeBuilder::new()
                .catch_interrupt(#catch_interrupt)
                .build()
            {
                Ok(handle) => handle,
                Err(err) => panic!("failed to build the greenhub runtime: {err}"),
            };

            match handle.block_on(async { #main_greenhub_fn().await }) {
                Ok(output) => output,
                Err(::greenhub::HubError::Interrupted) => ::std::process::exit(130),
                Err(err) => panic!("greenhub main did not complete: {err}"),
            }
        }
    };
    expanded.into()
}
