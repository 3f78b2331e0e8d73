// Copyright (C) 2025 the wgfleet authors
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use argon2::Argon2;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

#[derive(Debug, thiserror::Error)]
pub enum UserStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("username already taken")]
    UsernameTaken,
    #[error("password hashing failed")]
    PasswordHash,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("user still owns groups")]
    OwnsGroups,
}

type Result<T> = std::result::Result<T, UserStoreError>;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub display_name: String,
    password_hash: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    fn verify_password(&self, password: &str) -> Result<()> {
        let parsed =
            PasswordHash::new(&self.password_hash).map_err(|_| UserStoreError::PasswordHash)?;
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .map_err(|_| UserStoreError::InvalidCredentials)
    }
}

/// Partial update; `None` leaves the column untouched.
#[derive(Debug, Default)]
pub struct UserChanges {
    pub display_name: Option<String>,
    pub is_admin: Option<bool>,
}

fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|_| UserStoreError::PasswordHash)?
        .to_string())
}

#[derive(Debug, Clone)]
pub struct UserStore {
    pool: PgPool,
}

impl UserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip(self))]
    pub async fn is_empty(&self) -> Result<bool> {
        let (exists,): (bool,) = sqlx::query_as("SELECT EXISTS (SELECT 1 FROM users)")
            .fetch_one(&self.pool)
            .await?;
        Ok(!exists)
    }

    #[tracing::instrument(skip(self, password))]
    pub async fn create(
        &self,
        username: &str,
        display_name: &str,
        password: &str,
        is_admin: bool,
    ) -> Result<User> {
        let password_hash = hash_password(password)?;

        sqlx::query_as::<_, User>(
            "INSERT INTO users (username, display_name, password_hash, is_admin)
             VALUES ($1, $2, $3, $4)
             RETURNING *",
        )
        .bind(username)
        .bind(display_name)
        .bind(&password_hash)
        .bind(is_admin)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db_err)
                if db_err.constraint() == Some("users_username_key") =>
            {
                UserStoreError::UsernameTaken
            }
            _ => UserStoreError::Database(e),
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_all(&self) -> Result<Vec<User>> {
        sqlx::query_as::<_, User>("SELECT * FROM users ORDER BY username")
            .fetch_all(&self.pool)
            .await
            .map_err(Into::into)
    }

    #[tracing::instrument(skip(self, changes))]
    pub async fn update(&self, id: i64, changes: &UserChanges) -> Result<Option<User>> {
        sqlx::query_as::<_, User>(
            "UPDATE users SET
                display_name = COALESCE($2, display_name),
                is_admin = COALESCE($3, is_admin),
                updated_at = now()
             WHERE id = $1
             RETURNING *",
        )
        .bind(id)
        .bind(&changes.display_name)
        .bind(changes.is_admin)
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    #[tracing::instrument(skip(self, password))]
    pub async fn set_password(&self, id: i64, password: &str) -> Result<bool> {
        let password_hash = hash_password(password)?;
        let result =
            sqlx::query("UPDATE users SET password_hash = $2, updated_at = now() WHERE id = $1")
                .bind(id)
                .bind(&password_hash)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove a user and their group memberships. Fails with [`OwnsGroups`]
    /// while the user still owns a group; those must be deleted or handed
    /// over first.
    ///
    /// [`OwnsGroups`]: UserStoreError::OwnsGroups
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, id: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM group_members WHERE user_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db_err)
                    if db_err.constraint() == Some("groups_owner_id_fkey") =>
                {
                    UserStoreError::OwnsGroups
                }
                _ => UserStoreError::Database(e),
            })?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self))]
    pub async fn get(&self, id: i64) -> Result<Option<User>> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_by_username(&self, username: &str) -> Result<Option<User>> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    /// Check the password off the async runtime's hot path. Returns
    /// `InvalidCredentials` for an unknown username as well, so callers
    /// cannot distinguish the two.
    #[tracing::instrument(skip(self, password))]
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<User> {
        let user = self
            .get_by_username(username)
            .await?
            .ok_or(UserStoreError::InvalidCredentials)?;
        user.verify_password(password)?;
        Ok(user)
    }

    /// Admins see everything; otherwise the user must own the group or be
    /// listed as a member of it.
    #[tracing::instrument(skip(self))]
    pub async fn can_access_group(&self, user_id: i64, group_id: i64) -> Result<bool> {
        let (allowed,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM users WHERE id = $1 AND is_admin)
                 OR EXISTS (SELECT 1 FROM groups WHERE id = $2 AND owner_id = $1)
                 OR EXISTS (SELECT 1 FROM group_members
                            WHERE group_id = $2 AND user_id = $1)",
        )
        .bind(user_id)
        .bind(group_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(allowed)
    }

    #[tracing::instrument(skip(self))]
    pub async fn members_of(&self, group_id: i64) -> Result<Vec<User>> {
        sqlx::query_as::<_, User>(
            "SELECT u.* FROM users u
             JOIN group_members gm ON gm.user_id = u.id
             WHERE gm.group_id = $1
             ORDER BY u.username",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }
}
