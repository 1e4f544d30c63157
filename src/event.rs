use serde::{Deserialize, Serialize};

use crate::error::AggregatorError;

/// The record body embedded in a commit, narrowed to the two collections this
/// aggregator cares about. Anything else (posts, follows, blocks, profiles)
/// collapses to `Other` and is dropped before it reaches a handler.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "$type")]
pub enum Record {
    #[serde(rename = "app.bsky.feed.like")]
    Like {
        subject: Subject,
        #[serde(rename = "createdAt", default, skip_serializing_if = "Option::is_none")]
        created_at: Option<String>,
    },
    #[serde(rename = "app.bsky.feed.repost")]
    Repost {
        subject: Subject,
        #[serde(rename = "createdAt", default, skip_serializing_if = "Option::is_none")]
        created_at: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Subject {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Commit {
    pub rev: String,
    pub operation: Operation,
    pub collection: String,
    pub rkey: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CommitMessage {
    pub did: String,
    pub time_us: i64,
    pub kind: String,
    pub commit: Commit,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct IdentityMessage {
    pub did: String,
    pub time_us: i64,
    pub kind: String,
    pub identity: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AccountMessage {
    pub did: String,
    pub time_us: i64,
    pub kind: String,
    pub account: serde_json::Value,
}

/// A parsed Jetstream frame. Only `Commit` ever reaches a like/repost handler;
/// `Identity`/`Account` exist so the dispatcher has somewhere to route them
/// instead of reaching for `serde_json::Value` directly.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Commit(CommitMessage),
    Identity(IdentityMessage),
    Account(AccountMessage),
}

/// Parses one Jetstream text frame into a tagged [`Event`].
pub fn parse(data: &str) -> Result<Event, AggregatorError> {
    let value: serde_json::Value = serde_json::from_str(data)?;
    let kind = value
        .get("kind")
        .and_then(|k| k.as_str())
        .ok_or_else(|| AggregatorError::Other("missing kind field".to_string()))?;

    let event = match kind {
        "commit" => Event::Commit(serde_json::from_value(value)?),
        "identity" => Event::Identity(serde_json::from_value(value)?),
        "account" => Event::Account(serde_json::from_value(value)?),
        other => return Err(AggregatorError::Other(format!("unknown kind {other:?}"))),
    };

    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commit_create_like() {
        let data = r#"{"did":"did:plc:uhtptnlcrj4wrxfjfcanf34q","time_us":1731539977109649,"kind":"commit","commit":{"rev":"3lauicnwejh2f","operation":"create","collection":"app.bsky.feed.like","rkey":"3lauicnw5op2f","record":{"$type":"app.bsky.feed.like","createdAt":"2024-11-13T23:19:36.449Z","subject":{"cid":"bafyreigw5ufnkavdzcczl2dusa3bcnkckhi4tscp6qsrsmg76s3ckseney","uri":"at://did:plc:6wthaiuqiys3y7eztkpsdam2/app.bsky.feed.post/3latjcehsho2n"}},"cid":"bafyreifsdaip3s5nm3hcz4fbgkxodnils75oi3rmqhipwtom34rxw4vwdi"}}"#;
        let event = parse(data).unwrap();
        match event {
            Event::Commit(msg) => {
                assert_eq!(msg.did, "did:plc:uhtptnlcrj4wrxfjfcanf34q");
                assert_eq!(msg.commit.operation, Operation::Create);
                assert_eq!(msg.commit.collection, "app.bsky.feed.like");
                match msg.commit.record {
                    Some(Record::Like { subject, .. }) => {
                        assert_eq!(
                            subject.uri,
                            "at://did:plc:6wthaiuqiys3y7eztkpsdam2/app.bsky.feed.post/3latjcehsho2n"
                        );
                    }
                    other => panic!("expected Like record, got {other:?}"),
                }
            }
            other => panic!("expected Commit event, got {other:?}"),
        }
    }

    #[test]
    fn parses_commit_create_repost() {
        let data = r#"{"did":"did:plc:aaa","time_us":1,"kind":"commit","commit":{"rev":"r1","operation":"create","collection":"app.bsky.feed.repost","rkey":"rk1","record":{"$type":"app.bsky.feed.repost","createdAt":"2024-11-13T23:19:36.449Z","subject":{"cid":"bafy1","uri":"at://did:plc:p/app.bsky.feed.post/r1"}},"cid":"bafy2"}}"#;
        let event = parse(data).unwrap();
        match event {
            Event::Commit(msg) => match msg.commit.record {
                Some(Record::Repost { subject, .. }) => {
                    assert_eq!(subject.uri, "at://did:plc:p/app.bsky.feed.post/r1");
                }
                other => panic!("expected Repost record, got {other:?}"),
            },
            other => panic!("expected Commit event, got {other:?}"),
        }
    }

    #[test]
    fn parses_commit_delete_without_record() {
        let data = r#"{"did":"did:plc:zfr76ms7mkg6ct7qldg5c3z5","time_us":1731623029598761,"kind":"commit","commit":{"rev":"3lawvnsupm222","operation":"delete","collection":"app.bsky.feed.like","rkey":"3kwrdj3olqr2t"}}"#;
        let event = parse(data).unwrap();
        match event {
            Event::Commit(msg) => {
                assert_eq!(msg.commit.operation, Operation::Delete);
                assert!(msg.commit.record.is_none());
            }
            other => panic!("expected Commit event, got {other:?}"),
        }
    }

    #[test]
    fn unrelated_collection_becomes_other() {
        let data = r#"{"did":"did:plc:aaa","time_us":1,"kind":"commit","commit":{"rev":"r1","operation":"create","collection":"app.bsky.graph.follow","rkey":"rk1","record":{"$type":"app.bsky.graph.follow","subject":"did:plc:bbb"}}}"#;
        let event = parse(data).unwrap();
        match event {
            Event::Commit(msg) => assert_eq!(msg.commit.record, Some(Record::Other)),
            other => panic!("expected Commit event, got {other:?}"),
        }
    }

    #[test]
    fn parses_identity_and_account() {
        let identity = r#"{"did":"did:plc:sh5zdynqtvfavtkv6estb73d","time_us":1731623029695659,"kind":"identity","identity":{"did":"did:plc:sh5zdynqtvfavtkv6estb73d","handle":"irlasajj.bsky.social","seq":3478739942,"time":"2024-11-14T22:23:49.147Z"}}"#;
        assert!(matches!(parse(identity).unwrap(), Event::Identity(_)));

        let account = r#"{"did":"did:plc:pvvfw4tru5kvzrpra5dairkv","time_us":1731623029648609,"kind":"account","account":{"active":true,"did":"did:plc:pvvfw4tru5kvzrpra5dairkv","seq":3478739895,"time":"2024-11-14T22:23:49.092Z"}}"#;
        assert!(matches!(parse(account).unwrap(), Event::Account(_)));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let data = r#"{"did":"did:plc:aaa","time_us":1,"kind":"mystery"}"#;
        assert!(parse(data).is_err());
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(parse("{not json").is_err());
    }
}
