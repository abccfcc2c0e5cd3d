//! Static table of v5 endpoints.
//!
//! Each entry is a request template: method, path with `{name}` placeholders
//! (absolute for endpoints outside the API host),
//! the rate-limit bucket it is gated against, and its paging and list
//! parameter rules. Binding a template produces a ready-to-submit
//! [`Request`].

use std::collections::BTreeMap;

use reqwest::Method;

use crate::error::{ApiError, Result};
use crate::http::encode_path_segment;
use crate::request::{Request, DEFAULT_BUCKET};

/// Bucket for the identity host, which is limited separately from the API.
pub const AUTH_BUCKET: &str = "auth";

/// Upper bound for `limit` and for comma-separated id/login lists.
pub const MAX_PAGE_SIZE: u64 = 100;

#[derive(Debug, Clone)]
pub struct Endpoint {
    pub id: &'static str,
    pub method: Method,
    pub path: &'static str,
    pub bucket: &'static str,
    /// Accepts `limit`/`offset` (or `cursor`) paging parameters.
    pub paged: bool,
    /// Query parameters holding comma-separated lists.
    pub list_params: &'static [&'static str],
    pub description: &'static str,
}

const fn endpoint(
    method: Method,
    id: &'static str,
    path: &'static str,
    paged: bool,
    list_params: &'static [&'static str],
    description: &'static str,
) -> Endpoint {
    Endpoint {
        id,
        method,
        path,
        bucket: DEFAULT_BUCKET,
        paged,
        list_params,
        description,
    }
}

const fn get(id: &'static str, path: &'static str, paged: bool, description: &'static str) -> Endpoint {
    endpoint(Method::GET, id, path, paged, &[], description)
}

pub static ENDPOINTS: &[Endpoint] = &[
    get("get_user", "users/{user_id}", false, "Get a user by id"),
    endpoint(Method::GET, "get_users", "users", false, &["login"], "Translate logins to users"),
    get("get_user_follows", "users/{user_id}/follows/channels", true, "Channels a user follows"),
    get("get_channel", "channels/{channel_id}", false, "Get a channel by id"),
    endpoint(
        Method::PUT,
        "update_channel",
        "channels/{channel_id}",
        false,
        &[],
        "Update channel status or game",
    ),
    get("get_channel_followers", "channels/{channel_id}/follows", true, "Followers of a channel"),
    get(
        "get_channel_subscribers",
        "channels/{channel_id}/subscriptions",
        true,
        "Subscribers of a channel",
    ),
    get("get_channel_videos", "channels/{channel_id}/videos", true, "Videos of a channel"),
    get("get_stream", "streams/{channel_id}", false, "Live stream of a channel"),
    endpoint(Method::GET, "get_live_streams", "streams", true, &["channel"], "Live streams"),
    get("get_top_games", "games/top", true, "Games by current viewers"),
    get("get_cheermotes", "bits/actions", false, "Available cheermotes"),
    get("get_chat_badges", "chat/{channel_id}/badges", false, "Chat badges of a channel"),
    get("search_channels", "search/channels", true, "Search channels"),
    get("get_clip", "clips/{slug}", false, "Get a clip by slug"),
    get("get_top_clips", "clips/top", true, "Top clips"),
    get("get_team", "teams/{team}", false, "Get a team by name"),
    Endpoint {
        id: "validate_token",
        method: Method::GET,
        path: "https://id.twitch.tv/oauth2/validate",
        bucket: AUTH_BUCKET,
        paged: false,
        list_params: &[],
        description: "Validate the OAuth token and list its scopes",
    },
];

pub fn lookup(id: &str) -> Option<&'static Endpoint> {
    ENDPOINTS.iter().find(|e| e.id == id)
}

impl Endpoint {
    /// Placeholder names in path order.
    pub fn path_args(&self) -> Vec<&'static str> {
        self.path
            .split('/')
            .filter_map(|seg| seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')))
            .collect()
    }

    /// Fill the template. Path arguments are percent-encoded; query
    /// parameters are validated against the paging and list rules.
    pub fn bind(
        &self,
        args: &BTreeMap<String, String>,
        params: BTreeMap<String, String>,
    ) -> Result<Request> {
        let mut segments = Vec::new();
        for seg in self.path.split('/') {
            match seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                Some(name) => {
                    let value = args
                        .get(name)
                        .filter(|v| !v.is_empty())
                        .ok_or_else(|| {
                            ApiError::InvalidRequest(format!(
                                "{} requires path argument `{}`",
                                self.id, name
                            ))
                        })?;
                    segments.push(encode_path_segment(value));
                }
                None => segments.push(seg.to_string()),
            }
        }
        if let Some(extra) = args.keys().find(|k| !self.path_args().contains(&k.as_str())) {
            return Err(ApiError::InvalidRequest(format!(
                "{} has no path argument `{}`",
                self.id, extra
            )));
        }

        self.validate_params(&params)?;

        let mut request = Request::new(self.method.clone(), segments.join("/")).with_bucket(self.bucket);
        request.params = params;
        Ok(request)
    }

    fn validate_params(&self, params: &BTreeMap<String, String>) -> Result<()> {
        if self.paged {
            if let Some(limit) = params.get("limit") {
                match limit.parse::<u64>() {
                    Ok(n) if (1..=MAX_PAGE_SIZE).contains(&n) => {}
                    _ => {
                        return Err(ApiError::InvalidRequest(format!(
                            "`limit` must be an integer in 1..={}",
                            MAX_PAGE_SIZE
                        )))
                    }
                }
            }
            if let Some(offset) = params.get("offset") {
                if offset.parse::<u64>().is_err() {
                    return Err(ApiError::InvalidRequest(
                        "`offset` must be a non-negative integer".into(),
                    ));
                }
            }
        } else if params.contains_key("limit") || params.contains_key("offset") {
            return Err(ApiError::InvalidRequest(format!("{} is not paged", self.id)));
        }

        for name in self.list_params {
            if let Some(list) = params.get(*name) {
                let count = list.split(',').filter(|s| !s.trim().is_empty()).count();
                if count == 0 || count as u64 > MAX_PAGE_SIZE {
                    return Err(ApiError::InvalidRequest(format!(
                        "`{}` must list between 1 and {} values",
                        name, MAX_PAGE_SIZE
                    )));
                }
            }
        }
        Ok(())
    }
}
