pub mod film;
pub mod film_daily_view;

pub use film::Model as Film;
pub use film_daily_view::Model as FilmDailyView;
