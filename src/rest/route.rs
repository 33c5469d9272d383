//! Route templates and their compiled, bucket-keyed form.

use crate::error::{ConnectorError, Result};
use reqwest::Method;
use serde::Serialize;
use std::fmt;

/// Placeholders that partition rate limits by default.
pub const DEFAULT_MAJOR_PARAMETERS: &[&str] =
    &["guild_id", "channel_id", "webhook_id", "interaction_token"];

/// An endpoint template such as `channels/{channel_id}/messages/{message_id}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    method: Method,
    template: &'static str,
    major_parameters: &'static [&'static str],
}

impl Route {
    pub const fn new(method: Method, template: &'static str) -> Self {
        Self {
            method,
            template,
            major_parameters: DEFAULT_MAJOR_PARAMETERS,
        }
    }

    /// Overrides which placeholders contribute to the bucket key.
    pub fn with_major_parameters(self, major: &'static [&'static str]) -> Self {
        Self {
            method: self.method,
            template: self.template,
            major_parameters: major,
        }
    }

    pub const fn get(template: &'static str) -> Self {
        Self::new(Method::GET, template)
    }

    pub const fn post(template: &'static str) -> Self {
        Self::new(Method::POST, template)
    }

    pub const fn put(template: &'static str) -> Self {
        Self::new(Method::PUT, template)
    }

    pub const fn patch(template: &'static str) -> Self {
        Self::new(Method::PATCH, template)
    }

    pub const fn delete(template: &'static str) -> Self {
        Self::new(Method::DELETE, template)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn template(&self) -> &'static str {
        self.template
    }

    /// Placeholder names in template order.
    pub fn parameters(&self) -> Vec<&'static str> {
        placeholders(self.template).map(|(_, _, name)| name).collect()
    }

    /// Binds `values` to the placeholders in order.
    pub fn compile(&self, values: &[&str]) -> Result<CompiledRoute> {
        let expected = placeholders(self.template).count();
        if expected != values.len() {
            return Err(ConnectorError::InvalidRoute {
                template: self.template,
                expected,
                received: values.len(),
            });
        }

        let mut path = String::with_capacity(self.template.len() + 32);
        let mut major_values = Vec::new();
        let mut cursor = 0;
        for ((start, end, name), value) in placeholders(self.template).zip(values) {
            if value.is_empty() || value.contains('/') {
                return Err(ConnectorError::ParameterValueError {
                    param: name.to_string(),
                    value: value.to_string(),
                });
            }
            path.push_str(&self.template[cursor..start]);
            path.push_str(value);
            cursor = end;
            if self.major_parameters.contains(&name) {
                major_values.push(*value);
            }
        }
        path.push_str(&self.template[cursor..]);

        let mut bucket_key = format!("{} {}", self.method, self.template);
        if !major_values.is_empty() {
            bucket_key.push(':');
            bucket_key.push_str(&major_values.join(":"));
        }

        Ok(CompiledRoute {
            route: self.clone(),
            path,
            query: None,
            bucket_key: BucketKey(bucket_key),
        })
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.template)
    }
}

/// Yields `(start, end, name)` for every `{name}` in the template.
fn placeholders(template: &'static str) -> impl Iterator<Item = (usize, usize, &'static str)> {
    let mut offset = 0;
    std::iter::from_fn(move || {
        let open = template[offset..].find('{')? + offset;
        let close = template[open..].find('}')? + open;
        offset = close + 1;
        Some((open, close + 1, &template[open + 1..close]))
    })
}

/// Identity of a rate-limit bucket: method, template and major parameter values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey(String);

impl BucketKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A route with all placeholders bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledRoute {
    route: Route,
    path: String,
    query: Option<String>,
    bucket_key: BucketKey,
}

impl CompiledRoute {
    /// Appends query parameters serialized with `serde_qs`. The bucket key is unchanged.
    pub fn with_query<T: Serialize>(mut self, params: &T) -> Result<Self> {
        let query = serde_qs::to_string(params)?;
        self.push_query(&query);
        Ok(self)
    }

    /// Appends explicit `key=value` pairs, URL-encoding both sides.
    pub fn with_query_pairs(mut self, pairs: &[(&str, &str)]) -> Self {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        self.push_query(&query);
        self
    }

    fn push_query(&mut self, query: &str) {
        if query.is_empty() {
            return;
        }
        match &mut self.query {
            Some(existing) => {
                existing.push('&');
                existing.push_str(query);
            }
            None => self.query = Some(query.to_string()),
        }
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn method(&self) -> &Method {
        &self.route.method
    }

    /// Path relative to the API base URL, query string included.
    pub fn path(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }

    pub fn bucket_key(&self) -> &BucketKey {
        &self.bucket_key
    }
}

impl fmt::Display for CompiledRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.route.method, self.path())
    }
}

/// Routes the core itself calls.
pub mod routes {
    use super::Route;

    pub const GET_GATEWAY_BOT: Route = Route::get("gateway/bot");
    pub const GET_MESSAGE: Route = Route::get("channels/{channel_id}/messages/{message_id}");
    pub const CREATE_MESSAGE: Route = Route::post("channels/{channel_id}/messages");
    pub const DELETE_MESSAGE: Route = Route::delete("channels/{channel_id}/messages/{message_id}");
    pub const GET_GUILD_MEMBER: Route = Route::get("guilds/{guild_id}/members/{user_id}");
}

#[cfg(test)]
mod tests {
    use super::routes::*;
    use super::*;

    #[test]
    fn test_compile_substitutes_in_order() {
        let compiled = GET_MESSAGE.compile(&["100", "200"]).unwrap();
        assert_eq!(compiled.path(), "channels/100/messages/200");
        assert_eq!(compiled.method(), &Method::GET);
        assert_eq!(GET_MESSAGE.parameters(), vec!["channel_id", "message_id"]);
    }

    #[test]
    fn test_bucket_key_uses_only_major_parameters() {
        let a = GET_MESSAGE.compile(&["100", "1"]).unwrap();
        let b = GET_MESSAGE.compile(&["100", "2"]).unwrap();
        let c = GET_MESSAGE.compile(&["101", "1"]).unwrap();
        assert_eq!(a.bucket_key(), b.bucket_key());
        assert_ne!(a.bucket_key(), c.bucket_key());
        assert_eq!(
            a.bucket_key().as_str(),
            "GET channels/{channel_id}/messages/{message_id}:100"
        );
    }

    #[test]
    fn test_same_template_different_method_is_different_bucket() {
        let get = GET_MESSAGE.compile(&["1", "2"]).unwrap();
        let delete = DELETE_MESSAGE.compile(&["1", "2"]).unwrap();
        assert_ne!(get.bucket_key(), delete.bucket_key());
    }

    #[test]
    fn test_custom_major_parameters() {
        let route = Route::get("users/{user_id}/notes").with_major_parameters(&["user_id"]);
        let a = route.compile(&["5"]).unwrap();
        let b = route.compile(&["6"]).unwrap();
        assert_ne!(a.bucket_key(), b.bucket_key());

        let no_major = GET_GATEWAY_BOT.compile(&[]).unwrap();
        assert_eq!(no_major.bucket_key().as_str(), "GET gateway/bot");
    }

    #[test]
    fn test_compile_rejects_wrong_arity() {
        let result = GET_MESSAGE.compile(&["1"]);
        assert!(matches!(
            result,
            Err(ConnectorError::InvalidRoute {
                expected: 2,
                received: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_compile_rejects_path_injection() {
        let result = CREATE_MESSAGE.compile(&["1/../2"]);
        assert!(matches!(
            result,
            Err(ConnectorError::ParameterValueError { .. })
        ));
    }

    #[test]
    fn test_query_does_not_change_bucket() {
        #[derive(Serialize)]
        struct Params {
            limit: u32,
        }
        let plain = GET_GUILD_MEMBER.compile(&["9", "8"]).unwrap();
        let with_query = plain
            .clone()
            .with_query(&Params { limit: 50 })
            .unwrap()
            .with_query_pairs(&[("after", "a b")]);
        assert_eq!(with_query.path(), "guilds/9/members/8?limit=50&after=a+b");
        assert_eq!(plain.bucket_key(), with_query.bucket_key());
    }
}
