#![deny(missing_docs)]
//! A barebones client for the easel catalog service.
//!
//! The engine only relies on the [`Client::query_posts`] contract; the JSON
//! shapes in this crate are the deployment's concrete encoding of it.

mod client;
mod posts;
mod request;

pub use client::{Client, ClientError, ClientResult};
pub use posts::{
    ChannelSelector, Post, PostKind, PostSort, QueryPostsRequest, QueryPostsResponse,
};
