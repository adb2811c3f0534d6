use sea_orm_migration::prelude::*;

use super::film::Film;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m0002_film_daily_views"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(FilmDailyView::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(FilmDailyView::FilmId).integer().not_null())
                    .col(ColumnDef::new(FilmDailyView::Date).date().not_null())
                    .col(
                        ColumnDef::new(FilmDailyView::ViewCount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    // The upsert-increment conflicts on this key.
                    .primary_key(
                        Index::create()
                            .name("pk_film_daily_views")
                            .col(FilmDailyView::FilmId)
                            .col(FilmDailyView::Date),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_film_daily_views_film")
                            .from(FilmDailyView::Table, FilmDailyView::FilmId)
                            .to(Film::Table, Film::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_film_daily_views_date")
                    .table(FilmDailyView::Table)
                    .col(FilmDailyView::Date)
                    .if_not_exists()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(FilmDailyView::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub enum FilmDailyView {
    #[iden = "film_daily_views"]
    Table,
    FilmId,
    Date,
    ViewCount,
}
