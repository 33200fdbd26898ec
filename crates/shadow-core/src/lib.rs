//! Core data model for shadow-profile enrichment.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "shadow-core";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind}: {value}")]
pub struct ParseError {
    pub kind: &'static str,
    pub value: String,
}

/// Individually addressable profile attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileField {
    Username,
    DisplayName,
    Bio,
    Location,
    Website,
    JoinedDate,
    AvatarPresent,
    FollowersCount,
    FollowingCount,
    ListedInFollowing,
    ListedInFollowers,
}

impl ProfileField {
    pub const ALL: [ProfileField; 11] = [
        ProfileField::Username,
        ProfileField::DisplayName,
        ProfileField::Bio,
        ProfileField::Location,
        ProfileField::Website,
        ProfileField::JoinedDate,
        ProfileField::AvatarPresent,
        ProfileField::FollowersCount,
        ProfileField::FollowingCount,
        ProfileField::ListedInFollowing,
        ProfileField::ListedInFollowers,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProfileField::Username => "username",
            ProfileField::DisplayName => "display_name",
            ProfileField::Bio => "bio",
            ProfileField::Location => "location",
            ProfileField::Website => "website",
            ProfileField::JoinedDate => "joined_date",
            ProfileField::AvatarPresent => "avatar_present",
            ProfileField::FollowersCount => "followers_count",
            ProfileField::FollowingCount => "following_count",
            ProfileField::ListedInFollowing => "listed_in_following",
            ProfileField::ListedInFollowers => "listed_in_followers",
        }
    }
}

impl fmt::Display for ProfileField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProfileField {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProfileField::ALL
            .into_iter()
            .find(|field| field.as_str() == s)
            .ok_or_else(|| ParseError {
                kind: "profile field",
                value: s.to_string(),
            })
    }
}

/// Nullable attribute set shared by stored profiles and incoming fragments.
///
/// `None` always means "unknown", never "known to be empty".
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileFields {
    pub username: Option<String>,
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub location: Option<String>,
    pub website: Option<String>,
    pub joined_date: Option<NaiveDate>,
    pub avatar_present: Option<bool>,
    pub followers_count: Option<i64>,
    pub following_count: Option<i64>,
    pub listed_in_following: Option<bool>,
    pub listed_in_followers: Option<bool>,
}

fn blank_to_none(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn coalesce<T: Clone>(current: &mut Option<T>, incoming: &Option<T>) {
    if let Some(value) = incoming {
        *current = Some(value.clone());
    }
}

impl ProfileFields {
    /// Trims text fields and turns blank strings into `None`.
    pub fn normalized(self) -> Self {
        Self {
            username: blank_to_none(self.username),
            display_name: blank_to_none(self.display_name),
            bio: blank_to_none(self.bio),
            location: blank_to_none(self.location),
            website: blank_to_none(self.website),
            followers_count: self.followers_count.filter(|n| *n >= 0),
            following_count: self.following_count.filter(|n| *n >= 0),
            ..self
        }
    }

    /// Field-level COALESCE: every non-null incoming value replaces the stored
    /// one, null incoming values leave the stored value untouched.
    pub fn merge_from(&mut self, incoming: &ProfileFields) {
        coalesce(&mut self.username, &incoming.username);
        coalesce(&mut self.display_name, &incoming.display_name);
        coalesce(&mut self.bio, &incoming.bio);
        coalesce(&mut self.location, &incoming.location);
        coalesce(&mut self.website, &incoming.website);
        coalesce(&mut self.joined_date, &incoming.joined_date);
        coalesce(&mut self.avatar_present, &incoming.avatar_present);
        coalesce(&mut self.followers_count, &incoming.followers_count);
        coalesce(&mut self.following_count, &incoming.following_count);
        coalesce(&mut self.listed_in_following, &incoming.listed_in_following);
        coalesce(&mut self.listed_in_followers, &incoming.listed_in_followers);
    }

    pub fn has(&self, field: ProfileField) -> bool {
        match field {
            ProfileField::Username => self.username.is_some(),
            ProfileField::DisplayName => self.display_name.is_some(),
            ProfileField::Bio => self.bio.is_some(),
            ProfileField::Location => self.location.is_some(),
            ProfileField::Website => self.website.is_some(),
            ProfileField::JoinedDate => self.joined_date.is_some(),
            ProfileField::AvatarPresent => self.avatar_present.is_some(),
            ProfileField::FollowersCount => self.followers_count.is_some(),
            ProfileField::FollowingCount => self.following_count.is_some(),
            ProfileField::ListedInFollowing => self.listed_in_following.is_some(),
            ProfileField::ListedInFollowers => self.listed_in_followers.is_some(),
        }
    }

    pub fn known_fields(&self) -> Vec<ProfileField> {
        ProfileField::ALL
            .into_iter()
            .filter(|field| self.has(*field))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.known_fields().is_empty()
    }

    /// Location, website or join date, avatar flag and both counts are known.
    pub fn is_complete(&self) -> bool {
        self.location.is_some()
            && (self.website.is_some() || self.joined_date.is_some())
            && self.avatar_present.is_some()
            && self.followers_count.is_some()
            && self.following_count.is_some()
    }

    pub fn coverage(&self) -> f64 {
        if self.is_complete() {
            1.0
        } else {
            0.0
        }
    }
}

/// Which of an account's lists an edge was observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListType {
    Following,
    Follower,
}

impl ListType {
    pub fn as_str(self) -> &'static str {
        match self {
            ListType::Following => "following",
            ListType::Follower => "follower",
        }
    }
}

impl fmt::Display for ListType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ListType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "following" => Ok(ListType::Following),
            "follower" | "followers" => Ok(ListType::Follower),
            other => Err(ParseError {
                kind: "list type",
                value: other.to_string(),
            }),
        }
    }
}

/// Relationship reported by a source while fetching `source_account_id`'s profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeObservation {
    pub target_account_id: String,
    pub list_type: ListType,
}

/// Partial record returned by one source for one account.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PartialProfile {
    #[serde(default, flatten)]
    pub fields: ProfileFields,
    #[serde(default)]
    pub edges: Vec<EdgeObservation>,
}

impl PartialProfile {
    pub fn from_fields(fields: ProfileFields) -> Self {
        Self {
            fields,
            edges: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.edges.is_empty()
    }
}

/// Persisted merge result for one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowProfile {
    pub account_id: String,
    pub fields: ProfileFields,
    pub first_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_source: Option<String>,
}

impl ShadowProfile {
    pub fn coverage(&self) -> f64 {
        self.fields.coverage()
    }
}

/// Coverage for a possibly-missing profile; `None` means nothing is known yet.
pub fn coverage_score(profile: Option<&ShadowProfile>) -> Option<f64> {
    profile.map(ShadowProfile::coverage)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub source_account_id: String,
    pub target_account_id: String,
    pub list_type: ListType,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub reported_by: Option<String>,
}

/// Aggregate coverage over a population of accounts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageStats {
    pub accounts: usize,
    pub with_data: usize,
    pub complete: usize,
    pub mean_coverage: Option<f64>,
}

impl CoverageStats {
    pub fn from_scores<I>(scores: I) -> Self
    where
        I: IntoIterator<Item = Option<f64>>,
    {
        let mut stats = CoverageStats::default();
        let mut total = 0.0;
        for score in scores {
            stats.accounts += 1;
            if let Some(score) = score {
                stats.with_data += 1;
                total += score;
                if score >= 1.0 {
                    stats.complete += 1;
                }
            }
        }
        if stats.with_data > 0 {
            stats.mean_coverage = Some(total / stats.with_data as f64);
        }
        stats
    }

    /// Share of all accounts (including those without data) that are complete.
    pub fn complete_ratio(&self) -> f64 {
        if self.accounts == 0 {
            0.0
        } else {
            self.complete as f64 / self.accounts as f64
        }
    }
}
