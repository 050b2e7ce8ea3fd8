use serde::{Deserialize, Serialize};

use crate::{Client, ClientResult};

/// Which posts a channel shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSelector {
    /// Every public post.
    All,
    /// Posts promoted by the service.
    Promoted,
    /// The signed-in user's own posts.
    User,
    /// Posts by a specific user, addressed by their sqid.
    ByUser(String),
    /// Posts carrying a hashtag.
    Hashtag(String),
    /// A single artwork post.
    Artwork(i32),
}
impl ChannelSelector {
    /// The selector's wire form.
    pub fn to_query_value(&self) -> String {
        match self {
            ChannelSelector::All => "all".to_string(),
            ChannelSelector::Promoted => "promoted".to_string(),
            ChannelSelector::User => "user".to_string(),
            ChannelSelector::ByUser(sqid) => format!("user:{sqid}"),
            ChannelSelector::Hashtag(tag) => format!("tag:{tag}"),
            ChannelSelector::Artwork(post_id) => format!("artwork:{post_id}"),
        }
    }
}

/// The sort order the service applies before paginating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PostSort {
    /// Newest posts first.
    #[default]
    Newest,
    /// Oldest posts first.
    Oldest,
}
impl PostSort {
    /// The sort's wire form.
    pub fn to_query_value(&self) -> &'static str {
        match self {
            PostSort::Newest => "newest",
            PostSort::Oldest => "oldest",
        }
    }
}

/// The kind of a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostKind {
    /// A single artwork.
    Artwork,
    /// An ordered collection of artworks.
    Playlist,
}

/// A post as returned by the catalog service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    /// The post ID, unique within the service.
    pub post_id: i32,
    /// The post kind.
    pub kind: PostKind,
    /// The handle of the post's owner.
    pub owner_handle: String,
    /// When the post was created, unix seconds.
    pub created_at: i64,
    /// When the post's metadata last changed, unix seconds.
    pub metadata_modified_at: i64,
    /// Display dwell time in milliseconds; 0 means unset.
    #[serde(default)]
    pub dwell_time_ms: u32,
    /// Content filter flags.
    #[serde(default)]
    pub filter_flags: u16,
    /// The artwork's storage key, canonical 36-char UUID form. Artworks only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_key: Option<String>,
    /// The URL the artwork file can be fetched from. Artworks only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub art_url: Option<String>,
    /// When the artwork file itself last changed, unix seconds. Artworks only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artwork_modified_at: Option<i64>,
    /// The artwork's file extension, e.g. "webp". Artworks only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    /// The total number of artworks in the playlist. Playlists only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_artworks: Option<u32>,
    /// The playlist's artworks, expanded up to the requested expansion
    /// factor, in play order. Playlists only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artworks: Option<Vec<Post>>,
}

/// Parameters for [`Client::query_posts`].
#[derive(Debug, Clone)]
pub struct QueryPostsRequest {
    /// Which posts to return.
    pub selector: ChannelSelector,
    /// The sort order.
    pub sort: PostSort,
    /// The pagination cursor from the previous page, if any.
    pub cursor: Option<String>,
    /// The maximum number of posts to return.
    pub limit: u32,
    /// The playlist expansion factor; 0 disables inline expansion.
    pub pe: u32,
}

/// The body of a successful [`Client::query_posts`] response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPostsResponse {
    /// The returned posts, in the requested sort order.
    pub posts: Vec<Post>,
    /// Whether more posts are available past this page.
    pub has_more: bool,
    /// The cursor to pass for the next page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

impl Client {
    /// Query a page of posts for a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the service reports one.
    pub async fn query_posts(
        &self,
        request: &QueryPostsRequest,
    ) -> ClientResult<QueryPostsResponse> {
        let mut parameters = vec![
            ("channel", request.selector.to_query_value()),
            ("sort", request.sort.to_query_value().to_string()),
            ("limit", request.limit.to_string()),
            ("pe", request.pe.to_string()),
        ];
        if let Some(cursor) = &request.cursor {
            parameters.push(("cursor", cursor.clone()));
        }

        self.request("queryPosts", &parameters).await
    }

    /// The URL an artwork file is fetched from. The scheme is a deployment
    /// detail; only the engine's vault layout is contractual.
    pub fn artwork_url(&self, storage_key: &str, suffix: &str) -> String {
        format!("{}/art/{storage_key}{suffix}", self.base_url)
    }

    /// Fetch an artwork file from its `art_url`, following redirects.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the upstream returns a
    /// non-success status.
    pub async fn fetch_artwork(&self, art_url: &str) -> ClientResult<Vec<u8>> {
        let response = self.client.get(art_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(crate::ClientError::HttpStatus(status.as_u16()));
        }
        Ok(response.bytes().await?.into())
    }
}
