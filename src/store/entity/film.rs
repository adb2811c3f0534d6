use sea_orm::entity::prelude::*;
use serde::Deserialize;
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "films")]
#[serde(rename_all = "camelCase")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id:         i32,
    #[sea_orm(unique)]
    pub slug:       String,
    pub title:      String,
    /// Lifetime total. Only ever grows.
    pub view_count: i64,
    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::film_daily_view::Entity")]
    DailyViews,
}

impl Related<super::film_daily_view::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DailyViews.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
