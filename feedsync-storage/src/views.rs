//! Derived views.
//!
//! Everything here is computed from [`EntityStore::query`] on demand. Counts
//! are never stored next to the records they count.

use crate::EntityStore;
use feedsync_model::{Collection, Comment, Entity, EntityKey, Post, Profile};
use feedsync_types::{EntityId, UserId};

/// The stats block shown on a profile page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProfileStats {
    pub posts: usize,
    pub followers: usize,
    pub following: usize,
}

impl EntityStore {
    // ── Posts ────────────────────────────────────────────────────

    /// The home feed: every live post, newest first.
    ///
    /// Posts created at the same instant are ordered by id, newest first.
    pub fn feed(&self) -> Vec<Post> {
        let mut posts: Vec<Post> = self
            .all(Collection::Posts)
            .iter()
            .filter_map(Entity::as_post)
            .cloned()
            .collect();
        sort_newest_first(&mut posts);
        posts
    }

    /// Live posts by one author, newest first.
    pub fn posts_by(&self, author: UserId) -> Vec<Post> {
        let query = self.query(Collection::Posts, move |entity| {
            entity.as_post().is_some_and(|p| p.author_id == author)
        });
        let mut posts: Vec<Post> = query.iter().filter_map(Entity::as_post).cloned().collect();
        sort_newest_first(&mut posts);
        posts
    }

    /// A live post.
    pub fn post(&self, id: EntityId) -> Option<Post> {
        match self.stored(&EntityKey::post(id))? {
            crate::StoredValue::Live(Entity::Post(post)) => Some(post.clone()),
            _ => None,
        }
    }

    /// Whether `user` wrote the live post `post_id` and may therefore edit
    /// or delete it.
    pub fn is_author(&self, post_id: EntityId, user: UserId) -> bool {
        self.post(post_id).is_some_and(|p| p.author_id == user)
    }

    // ── Comments ─────────────────────────────────────────────────

    /// Live comments on a post, oldest first.
    pub fn comments_on(&self, post_id: EntityId) -> Vec<Comment> {
        let query = self.query(Collection::Comments, move |entity| {
            entity.as_comment().is_some_and(|c| c.post_id == post_id)
        });
        let mut comments: Vec<Comment> =
            query.iter().filter_map(Entity::as_comment).cloned().collect();
        comments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        comments
    }

    pub fn comment_count(&self, post_id: EntityId) -> usize {
        self.query(Collection::Comments, move |entity| {
            entity.as_comment().is_some_and(|c| c.post_id == post_id)
        })
        .count()
    }

    // ── Likes ────────────────────────────────────────────────────

    pub fn like_count(&self, post_id: EntityId) -> usize {
        self.query(Collection::Likes, move |entity| {
            entity.as_like().is_some_and(|l| l.post_id == post_id)
        })
        .count()
    }

    pub fn is_liked(&self, post_id: EntityId, user: UserId) -> bool {
        self.is_live(&EntityKey::like(post_id, user))
    }

    // ── Follows ──────────────────────────────────────────────────

    pub fn is_following(&self, follower: UserId, followee: UserId) -> bool {
        self.is_live(&EntityKey::follow(follower, followee))
    }

    /// Number of users following `user`.
    pub fn follower_count(&self, user: UserId) -> usize {
        self.query(Collection::Follows, move |entity| {
            entity.as_follow().is_some_and(|f| f.followee_id == user)
        })
        .count()
    }

    /// Number of users `user` follows.
    pub fn following_count(&self, user: UserId) -> usize {
        self.query(Collection::Follows, move |entity| {
            entity.as_follow().is_some_and(|f| f.follower_id == user)
        })
        .count()
    }

    // ── Profiles ─────────────────────────────────────────────────

    pub fn profile(&self, user: UserId) -> Option<Profile> {
        self.get(&EntityKey::profile(user))
            .and_then(|entity| entity.as_profile().cloned())
    }

    pub fn profile_stats(&self, user: UserId) -> ProfileStats {
        ProfileStats {
            posts: self
                .query(Collection::Posts, move |entity| {
                    entity.as_post().is_some_and(|p| p.author_id == user)
                })
                .count(),
            followers: self.follower_count(user),
            following: self.following_count(user),
        }
    }
}

fn sort_newest_first(posts: &mut [Post]) {
    posts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
}
