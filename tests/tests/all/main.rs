mod health;
mod probe;
mod registry;
