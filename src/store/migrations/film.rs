use sea_orm_migration::prelude::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m0001_films"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Film::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Film::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Film::Slug).string().not_null().unique_key())
                    .col(ColumnDef::new(Film::Title).string().not_null())
                    .col(ColumnDef::new(Film::ViewCount).big_integer().not_null().default(0))
                    .col(
                        ColumnDef::new(Film::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager.drop_table(Table::drop().table(Film::Table).to_owned()).await
    }
}

#[derive(Iden)]
pub enum Film {
    #[iden = "films"]
    Table,
    Id,
    Slug,
    Title,
    ViewCount,
    CreatedAt,
}
