//! Session cookies set on login and refresh, cleared on logout.

use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};

use crate::config::CookieConfig;
use crate::models::TokenPair;

fn session_cookie(config: &CookieConfig, name: &str, value: String, max_age_seconds: i64) -> Cookie<'static> {
    let mut cookie = Cookie::build((name.to_string(), value))
        .path("/")
        .http_only(true)
        .secure(config.secure)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::seconds(max_age_seconds));

    if let Some(domain) = &config.domain {
        cookie = cookie.domain(domain.clone());
    }

    cookie.build()
}

pub fn with_token_cookies(jar: CookieJar, config: &CookieConfig, pair: &TokenPair) -> CookieJar {
    jar.add(session_cookie(
        config,
        &config.access_name,
        pair.access_token.clone(),
        pair.expires_in,
    ))
    .add(session_cookie(
        config,
        &config.refresh_name,
        pair.refresh_token.clone(),
        pair.refresh_expires_in,
    ))
}

/// Expired replacements for both cookies. Added explicitly so they are sent
/// even when the request did not carry the cookies.
pub fn without_token_cookies(jar: CookieJar, config: &CookieConfig) -> CookieJar {
    let removal = |name: &str| {
        let mut cookie = Cookie::build((name.to_string(), String::new()))
            .path("/")
            .http_only(true)
            .secure(config.secure)
            .same_site(SameSite::Lax);
        if let Some(domain) = &config.domain {
            cookie = cookie.domain(domain.clone());
        }
        let mut cookie = cookie.build();
        cookie.make_removal();
        cookie
    };

    jar.add(removal(&config.access_name))
        .add(removal(&config.refresh_name))
}
