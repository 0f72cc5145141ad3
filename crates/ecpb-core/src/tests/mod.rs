mod dag;
mod db;
mod restore;
mod scheduler;
mod snapshot;
