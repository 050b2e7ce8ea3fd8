use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{Client, ClientError, ClientResult};

/// Making requests to the catalog service.
impl Client {
    /// Make a request to the catalog service. `T` is the body of the
    /// response envelope: that is, for `queryPosts`, `T` should be
    /// [`crate::QueryPostsResponse`].
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the response is not valid.
    pub async fn request<T: Serialize + DeserializeOwned>(
        &self,
        endpoint: &str,
        parameters: &[(&str, String)],
    ) -> ClientResult<T> {
        let bytes = self.request_raw(endpoint, parameters).await?;
        Self::parse_response::<T>(&bytes)
    }

    pub(crate) async fn request_raw(
        &self,
        endpoint: &str,
        parameters: &[(&str, String)],
    ) -> ClientResult<Vec<u8>> {
        let request = self
            .client
            .get(format!("{}/api/{endpoint}", self.base_url))
            .query(&[
                ("d", self.device_id.clone()),
                ("k", self.device_token.clone()),
                ("v", Self::API_VERSION.to_string()),
                ("f", "json".to_string()),
            ])
            .query(parameters);

        Ok(request.send().await?.bytes().await?.into())
    }

    fn parse_response<T: Serialize + DeserializeOwned>(bytes: &[u8]) -> ClientResult<T> {
        let response: Response<T> = serde_json::from_slice(bytes)?;

        if !response.catalog_response.success {
            let error = response
                .catalog_response
                .error
                .unwrap_or(ResponseError {
                    code: -1,
                    message: None,
                });
            return Err(ClientError::CatalogError {
                code: error.code,
                message: error.message,
            });
        }

        Ok(response.catalog_response.body)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Response<T> {
    pub catalog_response: CatalogResponse<T>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogResponse<T> {
    success: bool,
    error: Option<ResponseError>,

    // Response body
    #[serde(flatten)]
    body: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// An error reported by the catalog service.
struct ResponseError {
    /// The error code.
    code: i32,
    /// The error message.
    message: Option<String>,
}
