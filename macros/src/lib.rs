//! FlowSentry 过程宏
//!
//! `#[sentinel_resource]` 把函数体包在一次准入中：放行时执行原函数体，
//! 被拒绝时把原参数和 `BlockError` 交给拒绝处理函数。
//! 返回 `Result` 的函数体返回 `Err` 时计为异常，与 `Engine::guard` 一致。
//!
//! ```ignore
//! #[sentinel_resource(engine = ENGINE, name = "sayHello", block_handler = say_hello_blocked)]
//! fn say_hello(name: String) -> String {
//!     format!("Hello, {}", name)
//! }
//!
//! fn say_hello_blocked(name: String, block: flowsentry::BlockError) -> String {
//!     format!("Oops, {} blocked by {}", name, block.resource())
//! }
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::Parser;
use syn::punctuated::Punctuated;
use syn::spanned::Spanned;
use syn::{parse_macro_input, Expr, FnArg, Ident, ItemFn, Lit, Meta, Pat, ReturnType, Token, Type};

/// 资源保护属性宏
///
/// # 参数
/// - `engine`: 求值为 `Engine` 或 `&Engine` 的表达式（必填）
/// - `name`: 资源名，缺省为函数名
/// - `block_handler`: 拒绝处理函数路径（必填），签名为原参数加 `BlockError`，
///   返回类型与原函数相同；原函数为 async 时处理函数也必须是 async
#[proc_macro_attribute]
pub fn sentinel_resource(args: TokenStream, input: TokenStream) -> TokenStream {
    let input_fn = parse_macro_input!(input as ItemFn);

    let args = match ResourceArgs::parse(args.into()) {
        Ok(args) => args,
        Err(e) => return e.to_compile_error().into(),
    };

    match generate(&input_fn, &args) {
        Ok(tokens) => tokens.into(),
        Err(e) => e.to_compile_error().into(),
    }
}

/// 宏参数
struct ResourceArgs {
    engine: Expr,
    name: Option<String>,
    block_handler: Expr,
}

impl ResourceArgs {
    fn parse(tokens: TokenStream2) -> syn::Result<Self> {
        let span = tokens.span();
        let parsed = Punctuated::<Meta, Token![,]>::parse_terminated.parse2(tokens)?;

        let mut engine = None;
        let mut name = None;
        let mut block_handler = None;

        for meta in parsed {
            let nv = match meta {
                Meta::NameValue(nv) => nv,
                other => {
                    return Err(syn::Error::new(
                        other.span(),
                        "expected `key = value` arguments",
                    ))
                }
            };
            let key = nv
                .path
                .get_ident()
                .map(Ident::to_string)
                .unwrap_or_default();

            match key.as_str() {
                "engine" => engine = Some(nv.value),
                "block_handler" => block_handler = Some(nv.value),
                "name" => match nv.value {
                    Expr::Lit(syn::ExprLit {
                        lit: Lit::Str(lit), ..
                    }) => {
                        if lit.value().is_empty() {
                            return Err(syn::Error::new(lit.span(), "resource name must not be empty"));
                        }
                        name = Some(lit.value());
                    }
                    other => {
                        return Err(syn::Error::new(
                            other.span(),
                            "`name` must be a string literal",
                        ))
                    }
                },
                _ => {
                    return Err(syn::Error::new(
                        nv.path.span(),
                        format!("unknown argument `{}`", key),
                    ))
                }
            }
        }

        Ok(Self {
            engine: engine.ok_or_else(|| syn::Error::new(span, "missing `engine = ...`"))?,
            name,
            block_handler: block_handler
                .ok_or_else(|| syn::Error::new(span, "missing `block_handler = ...`"))?,
        })
    }
}

/// 收集参数名，拒绝处理函数按原顺序接收
fn argument_idents(input_fn: &ItemFn) -> syn::Result<Vec<Ident>> {
    input_fn
        .sig
        .inputs
        .iter()
        .map(|arg| match arg {
            FnArg::Receiver(receiver) => Err(syn::Error::new(
                receiver.span(),
                "#[sentinel_resource] does not support methods with `self`",
            )),
            FnArg::Typed(typed) => match typed.pat.as_ref() {
                Pat::Ident(pat) => Ok(pat.ident.clone()),
                other => Err(syn::Error::new(
                    other.span(),
                    "#[sentinel_resource] requires plain identifier arguments",
                )),
            },
        })
        .collect()
}

/// 函数体结果的类型标注；`impl Trait` 无法标注时省略
fn result_annotation(output: &ReturnType) -> TokenStream2 {
    match output {
        ReturnType::Default => quote!(: ()),
        ReturnType::Type(_, ty) => match ty.as_ref() {
            Type::ImplTrait(_) => quote!(),
            ty => quote!(: #ty),
        },
    }
}

/// 返回类型的最后一段路径是否为 `Result`（含 `io::Result` 等别名）
fn returns_result(output: &ReturnType) -> bool {
    match output {
        ReturnType::Type(_, ty) => match ty.as_ref() {
            Type::Path(path) => path
                .path
                .segments
                .last()
                .map(|segment| segment.ident == "Result")
                .unwrap_or(false),
            _ => false,
        },
        ReturnType::Default => false,
    }
}

fn generate(input_fn: &ItemFn, args: &ResourceArgs) -> syn::Result<TokenStream2> {
    let attrs = &input_fn.attrs;
    let vis = &input_fn.vis;
    let sig = &input_fn.sig;
    let block = &input_fn.block;
    let engine = &args.engine;
    let handler = &args.block_handler;
    let resource = args
        .name
        .clone()
        .unwrap_or_else(|| sig.ident.to_string());
    let idents = argument_idents(input_fn)?;
    let annotation = result_annotation(&sig.output);
    let (binding, record_error) = if returns_result(&sig.output) {
        (
            quote!(mut __flowsentry_entry),
            quote! {
                if __flowsentry_result.is_err() {
                    __flowsentry_entry.set_error();
                }
            },
        )
    } else {
        (quote!(__flowsentry_entry), quote!())
    };

    let body = if sig.asyncness.is_some() {
        quote! {
            match (#engine).entry_async(#resource).await {
                Ok(#binding) => {
                    let __flowsentry_result #annotation = async move #block.await;
                    #record_error
                    drop(__flowsentry_entry);
                    __flowsentry_result
                }
                Err(__flowsentry_block) => #handler(#(#idents,)* __flowsentry_block).await,
            }
        }
    } else {
        quote! {
            match (#engine).entry(#resource) {
                Ok(#binding) => {
                    let __flowsentry_result #annotation = (|| #block)();
                    #record_error
                    drop(__flowsentry_entry);
                    __flowsentry_result
                }
                Err(__flowsentry_block) => #handler(#(#idents,)* __flowsentry_block),
            }
        }
    };

    Ok(quote! {
        #(#attrs)*
        #vis #sig {
            #body
        }
    })
}
