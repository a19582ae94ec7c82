use proc_macro::TokenStream;
use quote::quote;
use syn;

pub fn impl_deser_macro(ast: &syn::DeriveInput) -> TokenStream {
    let name = ast.ident.clone();
    let is_tuple_struct = match ast.data {
        syn::Data::Struct(ref data) => matches!(data.fields, syn::Fields::Unnamed(_)),
        _ => false,
    };
    let statements: Vec<quote::__private::TokenStream> = match ast.data {
        syn::Data::Struct(ref data) => data
            .fields
            .iter()
            .zip(0..1_000_000)
            .map(|(field, index)| deserialize_field(field, index))
            .collect(),
        // Deriving on enums is unsupported: consensus enums carry their own
        // discriminating rules (e.g. coinbase inputs keyed on a null hash).
        _ => unimplemented!(),
    };
    let expanded = if is_tuple_struct {
        quote! {
            impl BchDeserialize for #name {
                fn bch_deserialize<R: std::io::Read>(mut target: R) -> Result<Self, SerializationError>
                {
                    Ok(#name (
                        #(#statements)*
                    ))
                }
            }
        }
    } else {
        quote! {
            impl BchDeserialize for #name {
                fn bch_deserialize<R: std::io::Read>(mut target: R) -> Result<Self, SerializationError>
                {
                    Ok(#name {
                        #(#statements)*
                    })
                }
            }
        }
    };

    TokenStream::from(expanded)
}

fn deserialize_field(field: &syn::Field, _index: usize) -> quote::__private::TokenStream {
    let ty = field.ty.clone();
    match field.ident.clone() {
        Some(name) => {
            quote! { #name: <#ty as BchDeserialize>::bch_deserialize(&mut target)?, }
        }
        None => {
            quote! {<#ty>::bch_deserialize(&mut target)?,}
        }
    }
}
