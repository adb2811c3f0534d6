//! Durable side of the pipeline: per-film totals and per-film-per-day counts in a relational database.
//!
//! All increments are relative (`view_count = view_count + n`), so concurrent transactions never lose updates.
pub mod driver;
pub mod entity;
pub mod migrations;

use std::fmt::Debug;

use async_trait::async_trait;
use chrono::NaiveDate;
use chrono::Utc;
use sea_orm::sea_query::Alias;
use sea_orm::sea_query::Expr;
use sea_orm::sea_query::Func;
use sea_orm::sea_query::OnConflict;
use sea_orm::sea_query::SimpleExpr;
use sea_orm::ActiveValue::NotSet;
use sea_orm::ActiveValue::Set;
use sea_orm::ColumnTrait;
use sea_orm::ConnectionTrait;
use sea_orm::DatabaseBackend;
use sea_orm::DatabaseConnection;
use sea_orm::EntityTrait;
use sea_orm::QueryFilter;
use sea_orm::QueryOrder;
use sea_orm::QuerySelect;
use sea_orm::TransactionTrait;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::instrument;

use crate::error::StoreError;
use entity::film;
use entity::film_daily_view;

/// Views to add to one film on one day.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewDelta {
    pub film_id: i32,
    pub day:     NaiveDate,
    pub count:   i64,
}

impl ViewDelta {
    pub fn new(film_id: i32, day: NaiveDate, count: i64) -> Self {
        Self { film_id, day, count }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendingFilm {
    pub film_id: i32,
    pub views:   i64,
}

#[async_trait]
pub trait ViewStore: Debug + Send + Sync + 'static {
    /// Apply all deltas in one transaction: film totals and daily rows grow by each delta's count. Either every delta
    /// lands or none does. A delta for a film that doesn't exist fails the whole transaction.
    async fn apply_batch(&self, deltas: &[ViewDelta]) -> Result<(), StoreError>;

    /// Record a single view without going through the cache.
    async fn increment_direct(&self, film_id: i32, day: NaiveDate) -> Result<(), StoreError> {
        self.apply_batch(&[ViewDelta::new(film_id, day, 1)]).await
    }

    /// Lifetime total of a film, `None` if there is no such film.
    async fn total_views(&self, film_id: i32) -> Result<Option<i64>, StoreError>;

    async fn daily_views(&self, film_id: i32, day: NaiveDate) -> Result<i64, StoreError>;

    /// Films with the most daily views on or after `since`, most viewed first.
    async fn top_films_since(&self, since: NaiveDate, limit: u64) -> Result<Vec<TrendingFilm>, StoreError>;
}

#[derive(Clone, Debug)]
pub struct DbViewStore {
    db: DatabaseConnection,
}

impl DbViewStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Register a film with zero views.
    pub async fn add_film(&self, slug: &str, title: &str) -> Result<film::Model, StoreError> {
        let model = film::Entity::insert(film::ActiveModel {
            id:         NotSet,
            slug:       Set(slug.to_string()),
            title:      Set(title.to_string()),
            view_count: Set(0),
            created_at: Set(Utc::now()),
        })
        .exec_with_returning(&self.db)
        .await?;

        debug!("Added film #{} '{}'", model.id, model.slug);
        Ok(model)
    }

    async fn apply_delta<C: ConnectionTrait>(conn: &C, delta: &ViewDelta) -> Result<(), StoreError> {
        let updated = film::Entity::update_many()
            .col_expr(
                film::Column::ViewCount,
                Expr::col(film::Column::ViewCount).add(delta.count),
            )
            .filter(film::Column::Id.eq(delta.film_id))
            .exec(conn)
            .await?;

        if updated.rows_affected == 0 {
            return Err(StoreError::UnknownFilm(delta.film_id));
        }

        film_daily_view::Entity::insert(film_daily_view::ActiveModel {
            film_id:    Set(delta.film_id),
            date:       Set(delta.day),
            view_count: Set(delta.count),
        })
        .on_conflict(
            OnConflict::columns([film_daily_view::Column::FilmId, film_daily_view::Column::Date])
                .value(
                    film_daily_view::Column::ViewCount,
                    Expr::col((film_daily_view::Entity, film_daily_view::Column::ViewCount)).add(delta.count),
                )
                .to_owned(),
        )
        .exec_without_returning(conn)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ViewStore for DbViewStore {
    #[instrument(level = "debug", skip(self, deltas), fields(deltas = deltas.len()))]
    async fn apply_batch(&self, deltas: &[ViewDelta]) -> Result<(), StoreError> {
        if deltas.is_empty() {
            return Ok(());
        }

        // Dropping the transaction on error rolls it back.
        let txn = self.db.begin().await?;
        for delta in deltas {
            Self::apply_delta(&txn, delta).await?;
        }
        txn.commit().await?;

        Ok(())
    }

    async fn total_views(&self, film_id: i32) -> Result<Option<i64>, StoreError> {
        Ok(film::Entity::find_by_id(film_id)
            .one(&self.db)
            .await?
            .map(|film| film.view_count))
    }

    async fn daily_views(&self, film_id: i32, day: NaiveDate) -> Result<i64, StoreError> {
        Ok(film_daily_view::Entity::find_by_id((film_id, day))
            .one(&self.db)
            .await?
            .map_or(0, |row| row.view_count))
    }

    async fn top_films_since(&self, since: NaiveDate, limit: u64) -> Result<Vec<TrendingFilm>, StoreError> {
        // SUM over BIGINT is NUMERIC on PostgreSQL and DECIMAL on MySQL.
        let int_type = match self.db.get_database_backend() {
            DatabaseBackend::MySql => "SIGNED",
            _ => "BIGINT",
        };
        let views = SimpleExpr::from(Func::cast_as(
            Func::sum(Expr::col(film_daily_view::Column::ViewCount)),
            Alias::new(int_type),
        ));
        let by_views: SimpleExpr = Expr::col(Alias::new("views")).into();

        let rows: Vec<(i32, i64)> = film_daily_view::Entity::find()
            .select_only()
            .column(film_daily_view::Column::FilmId)
            .column_as(views, "views")
            .filter(film_daily_view::Column::Date.gte(since))
            .group_by(film_daily_view::Column::FilmId)
            .order_by_desc(by_views)
            .order_by_asc(film_daily_view::Column::FilmId)
            .limit(limit)
            .into_tuple()
            .all(&self.db)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(film_id, views)| TrendingFilm { film_id, views })
            .collect())
    }
}
