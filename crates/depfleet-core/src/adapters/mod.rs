pub mod manager;
pub mod npm;
pub(crate) mod process_utils;

pub use manager::{AdapterFuture, AdapterResult, Mutation, PackageManagerAdapter};
pub use npm::{
    NpmAdapter, NpmOptions, npm_install_args, npm_list_installed_request, npm_uninstall_args,
    parse_npm_list_installed,
};
