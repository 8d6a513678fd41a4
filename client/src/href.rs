//! URLs of the relay's message endpoints.
//!
//! ```text
//! /api/messages                                  stream, full history
//! /api/messages?lastEventId=9999                 stream, history after 9999
//! /api/messages?sseLongPoll=1                    long-poll, full history
//! /api/messages?sseLongPoll=1&lastEventId=9999   long-poll, history after 9999
//! ```

use crate::error::Error;
use events::message::{LAST_EVENT_ID_QUERY, LONGPOLL_QUERY};
use url::Url;

const MESSAGES_PATH: &str = "api/messages";

pub fn messages_url(base: &Url, last_event_id: Option<&str>, via_stream: bool) -> Result<Url, Error> {
    let mut url = endpoint(base, MESSAGES_PATH)?;
    {
        let mut query = url.query_pairs_mut();
        if !via_stream {
            query.append_pair(LONGPOLL_QUERY, "1");
        }
        if let Some(id) = last_event_id {
            query.append_pair(LAST_EVENT_ID_QUERY, id);
        }
    }
    if url.query() == Some("") {
        url.set_query(None);
    }
    Ok(url)
}

/// Where messages are published.
pub fn publish_url(base: &Url) -> Result<Url, Error> {
    endpoint(base, MESSAGES_PATH)
}

fn endpoint(base: &Url, path: &str) -> Result<Url, Error> {
    if base.cannot_be_a_base() {
        return Err(Error::InvalidUrl(format!("{base} cannot be a base url")));
    }
    // Keep any path prefix on the base.
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base.join(path)?)
}
