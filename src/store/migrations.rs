pub mod film;
pub mod film_daily_view;

use sea_orm_migration::prelude::*;

pub struct Migrator;

impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(film::Migration), Box::new(film_daily_view::Migration)]
    }
}
